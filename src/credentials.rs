use crate::backoff::FailureClass;
use crate::config::CredentialGroup;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A credential group handed out for one attempt. Identity is the pool index.
#[derive(Debug, Clone)]
pub struct CredentialLease {
    index: usize,
    group: Arc<CredentialGroup>,
}

impl CredentialLease {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn group(&self) -> &CredentialGroup {
        &self.group
    }
}

#[derive(Debug, Clone, Default)]
struct GroupHealth {
    cooldown_until: Option<Instant>,
    last_failed_at: Option<Instant>,
}

impl GroupHealth {
    fn is_healthy(&self, now: Instant) -> bool {
        self.cooldown_until.is_none_or(|until| now >= until)
    }
}

#[derive(Debug)]
struct PoolState {
    cursor: usize,
    health: Vec<GroupHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialHealth {
    pub index: usize,
    pub fingerprint: String,
    pub healthy: bool,
    pub cooldown_remaining_ms: u64,
}

/// Round-robin pool of upstream credential groups with per-group cooldowns.
///
/// The cursor and health flags sit behind one mutex that is never held across
/// an await point.
#[derive(Debug)]
pub struct CredentialPool {
    groups: Vec<Arc<CredentialGroup>>,
    state: Mutex<PoolState>,
    rate_limit_cooldown: Duration,
    auth_cooldown: Duration,
}

impl CredentialPool {
    pub fn new(groups: Vec<CredentialGroup>, rate_limit_cooldown: Duration, auth_cooldown: Duration) -> Self {
        let health = vec![GroupHealth::default(); groups.len()];
        Self {
            groups: groups.into_iter().map(Arc::new).collect(),
            state: Mutex::new(PoolState { cursor: 0, health }),
            rate_limit_cooldown,
            auth_cooldown,
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Next healthy group in rotation, or the least recently failed one when
    /// every group is cooling down. `None` only for an empty pool.
    pub fn acquire(&self) -> Option<CredentialLease> {
        self.acquire_at(Instant::now())
    }

    fn acquire_at(&self, now: Instant) -> Option<CredentialLease> {
        let n = self.groups.len();
        if n == 0 {
            return None;
        }
        let mut state = self.lock();
        let start = state.cursor % n;
        let healthy = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&idx| state.health[idx].is_healthy(now));
        let index = match healthy {
            Some(idx) => idx,
            None => {
                let idx = least_recently_failed(&state.health);
                tracing::warn!(credential = idx, "all credentials cooling down, using least recently failed");
                idx
            }
        };
        state.cursor = (index + 1) % n;
        Some(self.lease_unchecked(index))
    }

    /// Hands out a specific group if it is currently healthy. Leaves the cursor alone.
    pub fn lease(&self, index: usize) -> Option<CredentialLease> {
        if index >= self.groups.len() {
            return None;
        }
        let state = self.lock();
        if state.health[index].is_healthy(Instant::now()) {
            Some(self.lease_unchecked(index))
        } else {
            None
        }
    }

    pub fn report_failure(&self, lease: &CredentialLease, class: FailureClass) {
        self.report_failure_at(lease, class, Instant::now());
    }

    fn report_failure_at(&self, lease: &CredentialLease, class: FailureClass, now: Instant) {
        let cooldown = match class {
            FailureClass::RateLimited => self.rate_limit_cooldown,
            FailureClass::CredentialInvalid => self.auth_cooldown,
            _ => return,
        };
        metrics::counter!("qwenize_credential_failures_total", "class" => class.as_str()).increment(1);
        let mut state = self.lock();
        let Some(entry) = state.health.get_mut(lease.index) else {
            return;
        };
        let until = now + cooldown;
        entry.cooldown_until = Some(entry.cooldown_until.map_or(until, |prev| prev.max(until)));
        entry.last_failed_at = Some(now);
        tracing::info!(
            credential = lease.index,
            fingerprint = %lease.group.fingerprint(),
            class = class.as_str(),
            cooldown_seconds = cooldown.as_secs(),
            "credential marked unhealthy"
        );
    }

    pub fn report_success(&self, lease: &CredentialLease) {
        let mut state = self.lock();
        let Some(entry) = state.health.get_mut(lease.index) else {
            return;
        };
        if entry.cooldown_until.take().is_some() {
            tracing::info!(credential = lease.index, "credential recovered");
        }
    }

    pub fn snapshot(&self) -> Vec<CredentialHealth> {
        let now = Instant::now();
        let state = self.lock();
        self.groups
            .iter()
            .enumerate()
            .map(|(index, group)| {
                let health = &state.health[index];
                let remaining = health
                    .cooldown_until
                    .map(|until| until.saturating_duration_since(now))
                    .unwrap_or_default();
                CredentialHealth {
                    index,
                    fingerprint: group.fingerprint(),
                    healthy: health.is_healthy(now),
                    cooldown_remaining_ms: remaining.as_millis() as u64,
                }
            })
            .collect()
    }

    fn lease_unchecked(&self, index: usize) -> CredentialLease {
        CredentialLease {
            index,
            group: self.groups[index].clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn least_recently_failed(health: &[GroupHealth]) -> usize {
    health
        .iter()
        .enumerate()
        .min_by_key(|(_, h)| h.last_failed_at)
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}
