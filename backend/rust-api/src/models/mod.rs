use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One entry in an assignment's practice pool. Owned by the external item
/// catalog; `original_index` is the stable catalog ordering and is never
/// reassigned here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningItem {
    pub id: String,
    pub term: String,
    pub translation: String,
    pub original_index: usize,
}

/// Per (assignment, student, item) exposure record. Created lazily on first
/// exposure, mutated only through the recorder's atomic upsert.
/// Invariant: `correct_count <= seen_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemProgress {
    #[serde(rename = "_id")]
    pub id: String,
    pub assignment_id: String,
    pub student_id: String,
    pub item_id: String,
    pub seen_count: u32,
    pub correct_count: u32,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl ItemProgress {
    pub fn compound_id(assignment_id: &str, student_id: &str, item_id: &str) -> String {
        format!("{}:{}:{}", assignment_id, student_id, item_id)
    }

    pub fn accuracy(&self) -> f64 {
        f64::from(self.correct_count) / f64::from(self.seen_count.max(1))
    }
}

/// Completion configuration attached to an assignment at creation time.
/// `exposure_target` of zero means the coverage goal is met by definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentGoal {
    #[serde(rename = "_id")]
    pub assignment_id: String,
    #[serde(default)]
    pub exposure_target: u32,
    /// game_id -> minimum completed assignment-mode sessions of that game.
    #[serde(default)]
    pub activity_requirements: HashMap<String, u32>,
}

/// Derived on demand by the completion evaluator; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionStatus {
    pub assignment_id: String,
    pub student_id: String,
    pub exposure_goal_met: bool,
    pub activity_goal_met: bool,
    pub is_complete: bool,
    pub exposed_words: u64,
    pub exposure_target: u32,
    pub missing_requirements: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Assignment,
    FreePlay,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Assignment => "assignment",
            SessionMode::FreePlay => "free_play",
        }
    }
}

/// Authoritative status view: one row per assignment x student x game,
/// replaced wholesale on every recorded session (last writer wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStatusRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub assignment_id: String,
    pub student_id: String,
    pub game_id: String,
    pub completed: bool,
    pub score: i32,
    pub accuracy: f64,
    pub duration_seconds: u32,
    pub items_attempted: u32,
    pub items_correct: u32,
    pub updated_at: DateTime<Utc>,
}

impl GameStatusRecord {
    pub fn compound_id(assignment_id: &str, student_id: &str, game_id: &str) -> String {
        format!("{}:{}:{}", assignment_id, student_id, game_id)
    }
}

/// Append-only session log: one row per record_session call. Audit trail and
/// the source for activity-goal session counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHistoryRecord {
    pub id: String,
    pub assignment_id: String,
    pub student_id: String,
    pub game_id: String,
    pub mode: SessionMode,
    pub completed: bool,
    pub score: i32,
    pub accuracy: f64,
    pub duration_seconds: u32,
    pub items_attempted: u32,
    pub items_correct: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Denormalized metrics view, best-effort projection of the session log.
/// Rebuildable from `session_history`; `best_*` fields only move upward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameMetricsRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub assignment_id: String,
    pub student_id: String,
    pub game_id: String,
    pub best_score: i32,
    pub best_accuracy: f64,
    pub last_played_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub mod session;
