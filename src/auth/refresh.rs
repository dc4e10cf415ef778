// Refresh scheduling
// Keeps at most one pending timer that refreshes the credential before it expires

use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::credentials;

/// Default lead time before expiry at which the refresh fires
pub const DEFAULT_REFRESH_LEAD_SECS: i64 = 60;

/// Observable state of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Scheduled { refresh_at: DateTime<Utc> },
}

/// Compute when to refresh a credential expiring at `expires_at`
///
/// Returns `None` when that moment has already passed or is out of range.
pub fn refresh_instant(
    expires_at: DateTime<Utc>,
    lead: Duration,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let refresh_at = expires_at.checked_sub_signed(lead)?;
    (refresh_at > now).then_some(refresh_at)
}

struct PendingRefresh {
    generation: u64,
    refresh_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    pending: Option<PendingRefresh>,
}

/// Single-shot refresh timer
///
/// `Idle → Scheduled → (Fired → Idle | Cancelled → Idle)`. Scheduling again
/// aborts the previous timer, so timers never accumulate.
pub struct RefreshScheduler {
    lead: Duration,
    slot: Arc<Mutex<Slot>>,
}

impl RefreshScheduler {
    pub fn new(lead_secs: i64) -> Self {
        Self {
            lead: Duration::seconds(lead_secs),
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    pub fn state(&self) -> SchedulerState {
        match self.slot.lock().pending {
            Some(ref pending) => SchedulerState::Scheduled {
                refresh_at: pending.refresh_at,
            },
            None => SchedulerState::Idle,
        }
    }

    /// Schedule `on_fire` to run `lead` before the credential expires
    ///
    /// Any pending timer is cancelled first. A malformed credential or one
    /// already inside the lead window leaves the scheduler idle. Must be
    /// called from within a tokio runtime.
    pub fn schedule<F>(&self, token: &str, on_fire: F) -> Option<DateTime<Utc>>
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.cancel();

        let claims = match credentials::decode_claims(token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::error!("Error parsing credential, refresh not scheduled: {}", e);
                return None;
            }
        };

        let Some(expires_at) = claims.expires_at() else {
            tracing::error!(exp = claims.exp, "Credential expiry out of range, refresh not scheduled");
            return None;
        };

        let now = Utc::now();
        if expires_at.checked_sub_signed(self.lead).is_none() {
            tracing::error!(exp = claims.exp, "Credential expiry out of range, refresh not scheduled");
            return None;
        }
        let Some(refresh_at) = refresh_instant(expires_at, self.lead, now) else {
            tracing::info!(
                expires_at = %expires_at.to_rfc3339(),
                "Credential already expired or about to, not scheduling refresh"
            );
            return None;
        };

        let delay = (refresh_at - now).to_std().unwrap_or_default();
        let Some(deadline) = tokio::time::Instant::now().checked_add(delay) else {
            tracing::error!(exp = claims.exp, "Credential expiry out of range, refresh not scheduled");
            return None;
        };

        let mut slot = self.slot.lock();
        slot.generation += 1;
        let generation = slot.generation;

        let handle = tokio::spawn(fire_after(deadline, generation, self.slot.clone(), on_fire));
        slot.pending = Some(PendingRefresh {
            generation,
            refresh_at,
            handle,
        });

        tracing::info!(
            "Token refresh scheduled in {} seconds (at {})",
            delay.as_secs(),
            refresh_at.to_rfc3339()
        );

        Some(refresh_at)
    }

    /// Cancel the pending timer, if any; idempotent
    pub fn cancel(&self) {
        if let Some(pending) = self.slot.lock().pending.take() {
            pending.handle.abort();
            tracing::debug!(generation = pending.generation, "Cancelled scheduled token refresh");
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Sleep, then run `on_fire` unless a newer schedule or a cancel got there first
async fn fire_after<F>(
    deadline: tokio::time::Instant,
    generation: u64,
    slot: Arc<Mutex<Slot>>,
    on_fire: F,
) where
    F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
{
    tokio::time::sleep_until(deadline).await;

    {
        let mut slot = slot.lock();
        if slot.pending.as_ref().map(|p| p.generation) != Some(generation) {
            return;
        }
        slot.pending = None;
    }

    tracing::debug!(generation = generation, "Scheduled token refresh firing");
    on_fire().await;
}
