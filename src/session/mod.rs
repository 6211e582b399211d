//! Session Management Module
//!
//! Per-session pairing state with:
//! - Concurrent session registry (DashMap) with atomic create per id
//! - Pure state machine for challenge, connect, reconnect and teardown
//! - Lifecycle events for observers

pub mod events;
pub mod machine;
pub mod registry;
pub mod state;

pub use events::{ChallengeKind, SessionEvent};
pub use machine::{ChallengeDecision, CloseOutcome, SessionMachine, TerminalCause};
pub use registry::{RegistryError, SessionControl, SessionEntry, SessionRegistry};
pub use state::{SessionInfo, SessionState, SessionStatus};
