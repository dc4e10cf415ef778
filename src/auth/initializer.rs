// Startup initializer
// One refresh attempt at boot when a stored session exists; never blocks startup

use super::manager::SessionManager;

/// What the initializer did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// The stored session was renewed and the refresh timer started
    Refreshed,
    /// The stored session could not be renewed and was dropped
    RefreshFailed,
    /// Nothing to restore
    NoStoredSession,
}

/// Run once before the client becomes interactive
pub async fn initialize(session: &SessionManager) -> InitOutcome {
    let has_credential = session
        .current_identity()
        .is_some_and(|account| account.credential().is_some());

    if !has_credential {
        tracing::info!("No token found, skipping refresh");
        return InitOutcome::NoStoredSession;
    }

    tracing::info!("Valid token found, attempting refresh");
    match session.refresh_token().await {
        Ok(_) => InitOutcome::Refreshed,
        Err(e) => {
            tracing::info!("Token refresh failed on startup, continuing anyway: {}", e);
            InitOutcome::RefreshFailed
        }
    }
}
