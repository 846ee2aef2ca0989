//! Integration event definitions
//!
//! Most quiz events are node-scoped: every backend instance needs its own
//! copy to notify the real-time clients connected to it. `ChallengeStarting`
//! is the exception - it drives the next game step, which must run on
//! exactly one instance, so the whole fleet competes on a single queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::event::IntegrationEvent;

/// A new challenge round is scheduled to begin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeStarting {
    pub quiz_id: String,
    pub start_date: DateTime<Utc>,
}

impl IntegrationEvent for ChallengeStarting {
    const NAME: &'static str = "ChallengeStarting";
}

/// The current challenge question changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeUpdated {
    pub quiz_id: String,
    pub question: String,
}

impl IntegrationEvent for ChallengeUpdated {
    const NAME: &'static str = "ChallengeUpdated";
    const NODE_SCOPED: bool = true;
}

/// The challenge round is over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeFinished {
    pub quiz_id: String,
}

impl IntegrationEvent for ChallengeFinished {
    const NAME: &'static str = "ChallengeFinished";
    const NODE_SCOPED: bool = true;
}

/// A user joined a quiz.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConnected {
    pub quiz_id: String,
    pub username: String,
}

impl IntegrationEvent for UserConnected {
    const NAME: &'static str = "UserConnected";
    const NODE_SCOPED: bool = true;
}

/// A user left a quiz.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserDisconnected {
    pub quiz_id: String,
    pub username: String,
}

impl IntegrationEvent for UserDisconnected {
    const NAME: &'static str = "UserDisconnected";
    const NODE_SCOPED: bool = true;
}

/// A user's score changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserScoreUpdated {
    pub quiz_id: String,
    pub username: String,
    pub score: i32,
}

impl IntegrationEvent for UserScoreUpdated {
    const NAME: &'static str = "UserScoreUpdated";
    const NODE_SCOPED: bool = true;
}
