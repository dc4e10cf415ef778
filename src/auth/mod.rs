// Authentication module
// Session state, credential decoding, refresh scheduling and startup restore

mod credentials;
mod initializer;
mod manager;
mod refresh;
mod types;

pub use credentials::decode_claims;
pub use initializer::{initialize, InitOutcome};
pub use manager::{SessionManager, AUTHENTICATE_PATH, REVOKE_PATH};
pub use refresh::{refresh_instant, RefreshScheduler, SchedulerState, DEFAULT_REFRESH_LEAD_SECS};
pub use types::{Account, RegisterRequest, SessionEvent, TokenClaims, LOGIN_ROUTE};
