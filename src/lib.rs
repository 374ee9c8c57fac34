pub mod app;
pub mod auth;
pub mod backoff;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod session;
pub mod upstream;
pub mod wire;
