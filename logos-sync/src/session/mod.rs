//! Session / presence tracking.
//!
//! Each device advertises one self-expiring record per joined document,
//! keyed `_{user}_{device}`. There is no disconnect signal, so liveness is
//! inferred from three layers:
//!
//! - explicit leave: an empty record
//! - lease: an empty record the transport publishes unless renewed
//! - expiry: records are ignored once `expires_ts` has passed
//!
//! ```text
//!            join()                 leave()
//!  Idle ─────────────► Joining ──► Joined ─────────► Leaving ──► Idle
//!   ▲                    │ publish failed                          │
//!   └────────────────────┘                                         │
//!   └──────────────────────────────────────────────────────────────┘
//! ```

pub mod lease;
pub mod manager;

pub use lease::DisconnectLease;
pub use manager::SessionManager;

use crate::protocol::SessionRecord;

/// Local session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Joining,
    Joined,
    Leaving,
}

/// Membership changes of remote sessions on the joined document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Joined(SessionRecord),
    /// Explicit leave, lease expiry, or a move to another document.
    Left { session_id: String },
}
