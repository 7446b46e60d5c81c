use std::collections::HashMap;

use anyhow::Context;
use mongodb::bson::doc;
use mongodb::Database;
use thiserror::Error;

use crate::metrics::{track_db_operation, COMPLETION_EVALUATIONS_TOTAL};
use crate::models::{AssignmentGoal, CompletionStatus, SessionMode};

use super::STORE_TIMEOUT;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("No completion goal configured for assignment {0}")]
    GoalNotFound(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Evaluates whether a learner has finished an assignment. Nothing here is
/// persisted; every call recomputes from the exposure and session views.
pub struct CompletionService {
    mongo: Database,
}

impl CompletionService {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    pub async fn evaluate(
        &self,
        assignment_id: &str,
        student_id: &str,
    ) -> Result<CompletionStatus, CompletionError> {
        let goal = self.load_goal(assignment_id).await?;

        let exposed_words = self.count_exposed_words(assignment_id, student_id).await?;

        let mut session_counts = HashMap::new();
        for game_id in goal.activity_requirements.keys() {
            let count = self
                .count_completed_sessions(assignment_id, student_id, game_id)
                .await?;
            session_counts.insert(game_id.clone(), count);
        }

        let status = build_status(&goal, student_id, exposed_words, &session_counts);

        COMPLETION_EVALUATIONS_TOTAL
            .with_label_values(&[if status.is_complete {
                "complete"
            } else {
                "incomplete"
            }])
            .inc();

        tracing::info!(
            assignment_id = %assignment_id,
            student_id = %student_id,
            is_complete = status.is_complete,
            exposed_words = status.exposed_words,
            "Completion evaluated"
        );

        Ok(status)
    }

    async fn load_goal(&self, assignment_id: &str) -> Result<AssignmentGoal, CompletionError> {
        let collection = self.mongo.collection::<AssignmentGoal>("assignment_goals");

        let goal = track_db_operation("find_one", "assignment_goals", async {
            tokio::time::timeout(
                STORE_TIMEOUT,
                collection.find_one(doc! { "_id": assignment_id }),
            )
            .await
            .context("assignment_goals lookup timed out")?
            .context("Failed to load assignment goal")
        })
        .await?;

        goal.ok_or_else(|| CompletionError::GoalNotFound(assignment_id.to_string()))
    }

    /// Distinct items this learner has been exposed to at least once.
    /// `seen_count` never decreases, so the filter is monotone.
    async fn count_exposed_words(
        &self,
        assignment_id: &str,
        student_id: &str,
    ) -> Result<u64, CompletionError> {
        let collection = self
            .mongo
            .collection::<mongodb::bson::Document>("item_progress");

        let count = track_db_operation("count", "item_progress", async {
            tokio::time::timeout(
                STORE_TIMEOUT,
                collection.count_documents(doc! {
                    "assignment_id": assignment_id,
                    "student_id": student_id,
                    "seen_count": { "$gt": 0 },
                }),
            )
            .await
            .context("item_progress count timed out")?
            .context("Failed to count exposed items")
        })
        .await?;

        Ok(count)
    }

    /// Completed assignment-mode sessions of one game, counted from the
    /// append-only session log. Free-play sessions never count toward goals.
    async fn count_completed_sessions(
        &self,
        assignment_id: &str,
        student_id: &str,
        game_id: &str,
    ) -> Result<u64, CompletionError> {
        let collection = self
            .mongo
            .collection::<mongodb::bson::Document>("session_history");

        let count = track_db_operation("count", "session_history", async {
            tokio::time::timeout(
                STORE_TIMEOUT,
                collection.count_documents(doc! {
                    "assignment_id": assignment_id,
                    "student_id": student_id,
                    "game_id": game_id,
                    "mode": SessionMode::Assignment.as_str(),
                    "completed": true,
                }),
            )
            .await
            .context("session_history count timed out")?
            .context("Failed to count completed sessions")
        })
        .await?;

        Ok(count)
    }
}

/// Pure combination step: folds the stored goal and the observed counts into
/// a status. Requirements are walked in sorted key order so the missing list
/// is stable across calls.
pub fn build_status(
    goal: &AssignmentGoal,
    student_id: &str,
    exposed_words: u64,
    session_counts: &HashMap<String, u64>,
) -> CompletionStatus {
    let exposure_goal_met = exposed_words >= u64::from(goal.exposure_target);

    let mut missing_requirements = Vec::new();
    if !exposure_goal_met {
        let deficit = u64::from(goal.exposure_target) - exposed_words;
        missing_requirements.push(format!("practice {} more words", deficit));
    }

    let mut activity_goal_met = true;
    let mut games: Vec<(&String, &u32)> = goal.activity_requirements.iter().collect();
    games.sort_by_key(|(game_id, _)| game_id.as_str());
    for (game_id, required) in games {
        let played = session_counts.get(game_id).copied().unwrap_or(0);
        if played < u64::from(*required) {
            activity_goal_met = false;
            let deficit = u64::from(*required) - played;
            missing_requirements.push(format!("play {} {} more times", game_id, deficit));
        }
    }

    CompletionStatus {
        assignment_id: goal.assignment_id.clone(),
        student_id: student_id.to_string(),
        exposure_goal_met,
        activity_goal_met,
        is_complete: exposure_goal_met && activity_goal_met,
        exposed_words,
        exposure_target: goal.exposure_target,
        missing_requirements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn goal(exposure_target: u32, requirements: &[(&str, u32)]) -> AssignmentGoal {
        AssignmentGoal {
            assignment_id: "a1".to_string(),
            exposure_target,
            activity_requirements: requirements
                .iter()
                .map(|(g, n)| (g.to_string(), *n))
                .collect(),
        }
    }

    #[test]
    fn both_goals_met_is_complete() {
        let goal = goal(20, &[("hangman", 2), ("matching", 1)]);
        let counts: HashMap<String, u64> =
            [("hangman".to_string(), 3), ("matching".to_string(), 1)]
                .into_iter()
                .collect();

        let status = build_status(&goal, "s1", 25, &counts);
        assert!(status.exposure_goal_met);
        assert!(status.activity_goal_met);
        assert!(status.is_complete);
        assert!(status.missing_requirements.is_empty());
    }

    #[test]
    fn exposure_deficit_is_reported() {
        let goal = goal(30, &[]);
        let status = build_status(&goal, "s1", 12, &HashMap::new());

        assert!(!status.exposure_goal_met);
        assert!(status.activity_goal_met);
        assert!(!status.is_complete);
        assert_eq!(
            status.missing_requirements,
            vec!["practice 18 more words".to_string()]
        );
    }

    #[test]
    fn activity_deficits_are_sorted_by_game() {
        let goal = goal(0, &[("wordsearch", 4), ("hangman", 2)]);
        let counts: HashMap<String, u64> = [("wordsearch".to_string(), 1)].into_iter().collect();

        let status = build_status(&goal, "s1", 0, &counts);
        assert!(status.exposure_goal_met);
        assert!(!status.activity_goal_met);
        assert_eq!(
            status.missing_requirements,
            vec![
                "play hangman 2 more times".to_string(),
                "play wordsearch 3 more times".to_string(),
            ]
        );
    }

    #[test]
    fn zero_exposure_target_is_met_by_definition() {
        let goal = goal(0, &[]);
        let status = build_status(&goal, "s1", 0, &HashMap::new());
        assert!(status.is_complete);
    }

    #[test]
    fn uncounted_game_defaults_to_zero_sessions() {
        let goal = goal(0, &[("matching", 1)]);
        let status = build_status(&goal, "s1", 0, &HashMap::new());
        assert!(!status.is_complete);
        assert_eq!(
            status.missing_requirements,
            vec!["play matching 1 more times".to_string()]
        );
    }
}
