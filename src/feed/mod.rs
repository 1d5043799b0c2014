//! Exchange feed
//!
//! - `protocol`: frame decoding and outbound requests
//! - `session`: connection state machine and message dispatch

pub mod protocol;
pub mod session;

pub use protocol::{normalize_pair, BookPayload, ControlEvent, DecodeError, FeedMessage};
pub use session::{Dispatch, FeedSession, HaltReason, SessionConfig, SessionState, SessionStats};
