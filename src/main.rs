use qwenize::app::startup_error;
use qwenize::error::AppError;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,qwenize=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = qwenize::app::load_state().await?;
    let app = qwenize::app::build_app(state.clone());
    let addr: std::net::SocketAddr = state
        .runtime
        .listen
        .parse()
        .map_err(|err: std::net::AddrParseError| startup_error("listen_invalid", err.to_string()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| startup_error("listen_failed", err.to_string()))?;
    tracing::info!(
        credentials = state.pool.len(),
        base_url = %state.config.base_url,
        "listening on {}",
        addr
    );
    axum::serve(listener, app)
        .await
        .map_err(|err| startup_error("serve_failed", err.to_string()))?;
    Ok(())
}
