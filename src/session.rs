use crate::config::GatewayConfig;
use crate::credentials::CredentialLease;
use crate::upstream::{Upstream, UpstreamErrorKind, UpstreamFailure};
use crate::wire::decode::qwen::decode_new_chat;
use crate::wire::encode::qwen::encode_new_chat;
use crate::wire::{ChatRequest, ConversationKey};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct Session {
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    pub credential: usize,
}

/// Maps conversation keys to upstream chat ids.
///
/// A chat id is only valid with the credential that created it, so lookups
/// check the binding and a mismatch creates a fresh chat.
pub struct SessionManager {
    upstream: Arc<dyn Upstream>,
    config: Arc<GatewayConfig>,
    sessions: DashMap<ConversationKey, Session>,
    creation_locks: DashMap<ConversationKey, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(upstream: Arc<dyn Upstream>, config: Arc<GatewayConfig>) -> Self {
        Self {
            upstream,
            config,
            sessions: DashMap::new(),
            creation_locks: DashMap::new(),
        }
    }

    /// Returns a chat id usable with `lease`. Without a key every call gets a
    /// new upstream chat that is not remembered.
    pub async fn get_or_create(
        &self,
        key: Option<&ConversationKey>,
        lease: &CredentialLease,
        req: &ChatRequest,
    ) -> Result<String, UpstreamFailure> {
        let Some(key) = key else {
            return self.create(lease, req).await;
        };
        if let Some(chat_id) = self.cached(key, lease.index()) {
            return Ok(chat_id);
        }

        let lock = self
            .creation_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            match self.cached(key, lease.index()) {
                Some(chat_id) => Ok(chat_id),
                None => self.create_keyed(key, lease, req).await,
            }
        };
        drop(lock);
        self.release_lock(key);
        result
    }

    async fn create_keyed(
        &self,
        key: &ConversationKey,
        lease: &CredentialLease,
        req: &ChatRequest,
    ) -> Result<String, UpstreamFailure> {
        let chat_id = self.create(lease, req).await?;
        self.sessions.insert(
            key.clone(),
            Session {
                chat_id: chat_id.clone(),
                created_at: Utc::now(),
                credential: lease.index(),
            },
        );
        Ok(chat_id)
    }

    /// Drops the creation lock once no caller holds or waits on it.
    fn release_lock(&self, key: &ConversationKey) {
        self.creation_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn bound_credential(&self, key: &ConversationKey) -> Option<usize> {
        self.sessions.get(key).map(|s| s.credential)
    }

    pub fn get(&self, key: &ConversationKey) -> Option<Session> {
        self.sessions.get(key).map(|s| s.value().clone())
    }

    pub fn invalidate(&self, key: &ConversationKey) {
        if let Some((_, session)) = self.sessions.remove(key) {
            tracing::info!(conversation = %key, chat_id = %session.chat_id, "session invalidated");
        }
        self.release_lock(key);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn cached(&self, key: &ConversationKey, credential: usize) -> Option<String> {
        self.sessions
            .get(key)
            .filter(|s| s.credential == credential)
            .map(|s| s.chat_id.clone())
    }

    async fn create(&self, lease: &CredentialLease, req: &ChatRequest) -> Result<String, UpstreamFailure> {
        let request = encode_new_chat(req, &self.config, lease.group(), Utc::now().timestamp_millis());
        let value = self.upstream.call_json(&request).await?;
        let chat_id = decode_new_chat(&value)
            .map_err(|err| UpstreamFailure::new(UpstreamErrorKind::Decode, None, err))?;
        metrics::counter!("qwenize_sessions_created_total").increment(1);
        tracing::debug!(
            credential = lease.index(),
            chat_id = %chat_id,
            model = %req.model,
            mode = req.mode.as_str(),
            "created upstream chat"
        );
        Ok(chat_id)
    }
}
