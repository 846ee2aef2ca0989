//! Quiz integration events
//!
//! The event types exchanged between quiz backend instances. The bus
//! implementation lives in `bus`.

pub mod types;

pub use types::{
    ChallengeFinished, ChallengeStarting, ChallengeUpdated, UserConnected, UserDisconnected,
    UserScoreUpdated,
};
