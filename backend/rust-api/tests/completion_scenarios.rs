use std::collections::HashMap;

use lexiground_api::models::AssignmentGoal;
use lexiground_api::services::completion_service::build_status;

fn goal(exposure_target: u32, requirements: &[(&str, u32)]) -> AssignmentGoal {
    AssignmentGoal {
        assignment_id: "spanish-unit-3".to_string(),
        exposure_target,
        activity_requirements: requirements
            .iter()
            .map(|(game, count)| (game.to_string(), *count))
            .collect(),
    }
}

// A learner who has covered the words but skipped a required game is not
// complete, and the response says exactly what is left.
#[test]
fn words_done_but_game_missing() {
    let goal = goal(25, &[("hangman", 2), ("matching", 2)]);
    let counts: HashMap<String, u64> = [("hangman".to_string(), 2)].into_iter().collect();

    let status = build_status(&goal, "s1", 25, &counts);

    assert!(status.exposure_goal_met);
    assert!(!status.activity_goal_met);
    assert!(!status.is_complete);
    assert_eq!(
        status.missing_requirements,
        vec!["play matching 2 more times".to_string()]
    );
}

// Meeting the final requirement flips the assignment to complete with an
// empty missing list.
#[test]
fn last_session_completes_the_assignment() {
    let goal = goal(25, &[("hangman", 2), ("matching", 2)]);

    let before: HashMap<String, u64> =
        [("hangman".to_string(), 2), ("matching".to_string(), 1)]
            .into_iter()
            .collect();
    assert!(!build_status(&goal, "s1", 25, &before).is_complete);

    let after: HashMap<String, u64> =
        [("hangman".to_string(), 2), ("matching".to_string(), 2)]
            .into_iter()
            .collect();
    let status = build_status(&goal, "s1", 25, &after);

    assert!(status.is_complete);
    assert!(status.missing_requirements.is_empty());
}

// Exceeding a requirement never hurts, and exposure beyond the target is
// reported as-is.
#[test]
fn overshooting_requirements_is_fine() {
    let goal = goal(10, &[("hangman", 1)]);
    let counts: HashMap<String, u64> = [("hangman".to_string(), 7)].into_iter().collect();

    let status = build_status(&goal, "s1", 42, &counts);

    assert!(status.is_complete);
    assert_eq!(status.exposed_words, 42);
    assert_eq!(status.exposure_target, 10);
}

// An assignment with no requirements at all is complete from the start.
#[test]
fn empty_goal_is_trivially_complete() {
    let goal = goal(0, &[]);
    let status = build_status(&goal, "s1", 0, &HashMap::new());

    assert!(status.exposure_goal_met);
    assert!(status.activity_goal_met);
    assert!(status.is_complete);
}

// Both deficits are reported together, word coverage first.
#[test]
fn all_deficits_are_listed() {
    let goal = goal(30, &[("hangman", 3)]);
    let counts: HashMap<String, u64> = [("hangman".to_string(), 1)].into_iter().collect();

    let status = build_status(&goal, "s1", 20, &counts);

    assert!(!status.is_complete);
    assert_eq!(
        status.missing_requirements,
        vec![
            "practice 10 more words".to_string(),
            "play hangman 2 more times".to_string(),
        ]
    );
}
