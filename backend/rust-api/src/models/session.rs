use serde::{Deserialize, Serialize};
use validator::Validate;

use super::{LearningItem, SessionMode};

fn default_session_mode() -> SessionMode {
    SessionMode::Assignment
}

#[derive(Debug, Deserialize, Validate)]
pub struct SelectSessionRequest {
    #[validate(length(min = 1, message = "assignment_id must not be empty"))]
    pub assignment_id: String,
    #[validate(length(min = 1, message = "student_id must not be empty"))]
    pub student_id: String,
    #[validate(range(min = 1, max = 200, message = "session_size must be between 1 and 200"))]
    pub session_size: u32,
}

#[derive(Debug, Serialize)]
pub struct SelectSessionResponse {
    pub assignment_id: String,
    pub student_id: String,
    pub items: Vec<LearningItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item_id: String,
    pub correct: bool,
}

/// Result payload a game client reports after a completed (or abandoned)
/// practice round. Consumed once by the recorder; the history view is the
/// only durable trace of the payload itself.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RecordSessionRequest {
    #[validate(length(min = 1, message = "assignment_id must not be empty"))]
    pub assignment_id: String,
    #[validate(length(min = 1, message = "student_id must not be empty"))]
    pub student_id: String,
    #[validate(length(min = 1, message = "game_id must not be empty"))]
    pub game_id: String,
    #[serde(default = "default_session_mode")]
    pub mode: SessionMode,
    pub completed: bool,
    #[validate(range(min = 0, message = "score must not be negative"))]
    pub score: i32,
    #[validate(range(min = 0.0, max = 100.0, message = "accuracy must be within 0..=100"))]
    pub accuracy: f64,
    pub duration_seconds: u32,
    #[serde(default)]
    pub outcomes: Vec<ItemOutcome>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

impl RecordSessionRequest {
    pub fn items_attempted(&self) -> u32 {
        self.outcomes.len() as u32
    }

    pub fn items_correct(&self) -> u32 {
        self.outcomes.iter().filter(|o| o.correct).count() as u32
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RecordSessionResponse {
    pub assignment_id: String,
    pub student_id: String,
    pub game_id: String,
    pub completed: bool,
    pub items_attempted: u32,
    pub items_correct: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RecordExposureRequest {
    #[validate(length(min = 1, message = "assignment_id must not be empty"))]
    pub assignment_id: String,
    #[validate(length(min = 1, message = "student_id must not be empty"))]
    pub student_id: String,
    #[validate(length(min = 1, message = "item_id must not be empty"))]
    pub item_id: String,
    pub correct: bool,
}
