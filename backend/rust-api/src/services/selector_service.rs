use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::Database;
use thiserror::Error;

use crate::metrics::{track_db_operation, SELECTOR_FALLBACKS_TOTAL, SESSIONS_SELECTED_TOTAL};
use crate::models::session::SelectSessionRequest;
use crate::models::{ItemProgress, LearningItem};

use super::catalog_service::CatalogService;
use super::STORE_TIMEOUT;

/// Window over which staleness saturates. Dividing item age by this horizon
/// and clamping to [0, 1] keeps the recency term in the same numeric range
/// as accuracy, so neither term dominates the weakness score by unit
/// mismatch. An item untouched for 30 days (or never stamped) is maximally
/// stale.
pub const RECENCY_HORIZON_SECONDS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("Assignment {0} has an empty item pool")]
    EmptyPool(String),
    #[error(transparent)]
    Catalog(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    /// Entire batch is unseen items in pool order.
    Unseen,
    /// Every pool item has been seen; batch is weakest-first review.
    Review,
    /// Remaining unseen items topped up with the weakest seen items.
    Mixed,
}

impl SelectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStrategy::Unseen => "unseen",
            SelectionStrategy::Review => "review",
            SelectionStrategy::Mixed => "mixed",
        }
    }
}

/// Selects the next practice batch. Pure and deterministic: identical inputs
/// (including `now`) yield identical output.
///
/// Unseen items are served first, in catalog order, never shuffled. Once the
/// pool is exhausted, items are ranked ascending by
/// `accuracy - normalized_recency` so weak or stale items come back first.
/// The partial-fill branch ranks seen items by accuracy alone; recency only
/// participates when every item has been seen.
pub fn select_session(
    pool: &[LearningItem],
    progress: &HashMap<String, ItemProgress>,
    session_size: usize,
    now: DateTime<Utc>,
) -> (Vec<LearningItem>, SelectionStrategy) {
    let size = session_size.min(pool.len());

    let mut ordered: Vec<&LearningItem> = pool.iter().collect();
    ordered.sort_by_key(|item| item.original_index);

    let (unseen, seen): (Vec<&LearningItem>, Vec<&LearningItem>) = ordered
        .into_iter()
        .partition(|item| progress.get(&item.id).is_none_or(|p| p.seen_count == 0));

    if unseen.is_empty() {
        let mut ranked = seen;
        ranked.sort_by(|a, b| {
            weakness_score(a, progress, now)
                .total_cmp(&weakness_score(b, progress, now))
                .then(a.original_index.cmp(&b.original_index))
        });
        let batch = ranked.into_iter().take(size).cloned().collect();
        (batch, SelectionStrategy::Review)
    } else if unseen.len() >= size {
        let batch = unseen.into_iter().take(size).cloned().collect();
        (batch, SelectionStrategy::Unseen)
    } else {
        let mut batch: Vec<LearningItem> = unseen.into_iter().cloned().collect();
        let remaining = size - batch.len();

        let mut ranked = seen;
        ranked.sort_by(|a, b| {
            accuracy_of(a, progress)
                .total_cmp(&accuracy_of(b, progress))
                .then(a.original_index.cmp(&b.original_index))
        });
        batch.extend(ranked.into_iter().take(remaining).cloned());
        (batch, SelectionStrategy::Mixed)
    }
}

fn accuracy_of(item: &LearningItem, progress: &HashMap<String, ItemProgress>) -> f64 {
    progress.get(&item.id).map_or(0.0, ItemProgress::accuracy)
}

fn normalized_recency(
    item: &LearningItem,
    progress: &HashMap<String, ItemProgress>,
    now: DateTime<Utc>,
) -> f64 {
    match progress.get(&item.id).and_then(|p| p.last_seen_at) {
        Some(last_seen) => {
            let age_seconds = (now - last_seen).num_seconds().max(0) as f64;
            (age_seconds / RECENCY_HORIZON_SECONDS as f64).clamp(0.0, 1.0)
        }
        // Never stamped: treat as maximally stale.
        None => 1.0,
    }
}

fn weakness_score(
    item: &LearningItem,
    progress: &HashMap<String, ItemProgress>,
    now: DateTime<Utc>,
) -> f64 {
    accuracy_of(item, progress) - normalized_recency(item, progress, now)
}

pub struct SelectorService {
    mongo: Database,
    catalog: CatalogService,
}

impl SelectorService {
    pub fn new(mongo: Database, catalog: CatalogService) -> Self {
        Self { mongo, catalog }
    }

    /// Serves the next practice batch for a learner. Storage problems on the
    /// progress lookup never fail the caller: the selector degrades to the
    /// first `session_size` pool items in catalog order and reports the
    /// failure through metrics and logs.
    pub async fn next_session(
        &self,
        req: &SelectSessionRequest,
    ) -> Result<Vec<LearningItem>, SelectorError> {
        let pool = self.catalog.fetch_pool(&req.assignment_id).await?;
        if pool.is_empty() {
            return Err(SelectorError::EmptyPool(req.assignment_id.clone()));
        }

        let size = req.session_size as usize;

        let progress = match self
            .load_progress(&req.assignment_id, &req.student_id)
            .await
        {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(
                    assignment_id = %req.assignment_id,
                    student_id = %req.student_id,
                    error = %e,
                    "Progress lookup degraded, serving pool-order session"
                );
                SELECTOR_FALLBACKS_TOTAL
                    .with_label_values(&["progress_lookup"])
                    .inc();
                SESSIONS_SELECTED_TOTAL
                    .with_label_values(&["fallback"])
                    .inc();
                return Ok(pool_order_prefix(&pool, size));
            }
        };

        let (items, strategy) = select_session(&pool, &progress, size, Utc::now());
        SESSIONS_SELECTED_TOTAL
            .with_label_values(&[strategy.as_str()])
            .inc();

        tracing::info!(
            assignment_id = %req.assignment_id,
            student_id = %req.student_id,
            strategy = strategy.as_str(),
            batch_size = items.len(),
            "Practice session selected"
        );

        Ok(items)
    }

    async fn load_progress(
        &self,
        assignment_id: &str,
        student_id: &str,
    ) -> Result<HashMap<String, ItemProgress>> {
        let collection = self.mongo.collection::<ItemProgress>("item_progress");
        let filter = doc! {
            "assignment_id": assignment_id,
            "student_id": student_id,
        };

        let records: Vec<ItemProgress> = track_db_operation("find", "item_progress", async {
            let cursor = tokio::time::timeout(STORE_TIMEOUT, collection.find(filter))
                .await
                .context("item_progress query timed out")?
                .context("Failed to query item_progress")?;

            tokio::time::timeout(STORE_TIMEOUT, cursor.try_collect())
                .await
                .context("item_progress cursor timed out")?
                .context("item_progress cursor failure")
        })
        .await?;

        Ok(records
            .into_iter()
            .map(|p| (p.item_id.clone(), p))
            .collect())
    }
}

fn pool_order_prefix(pool: &[LearningItem], size: usize) -> Vec<LearningItem> {
    let mut ordered: Vec<&LearningItem> = pool.iter().collect();
    ordered.sort_by_key(|item| item.original_index);
    ordered.into_iter().take(size).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(idx: usize) -> LearningItem {
        LearningItem {
            id: format!("w{}", idx),
            term: format!("term-{}", idx),
            translation: format!("translation-{}", idx),
            original_index: idx,
        }
    }

    fn pool(n: usize) -> Vec<LearningItem> {
        (0..n).map(item).collect()
    }

    fn progress_for(
        idx: usize,
        seen: u32,
        correct: u32,
        last_seen: Option<DateTime<Utc>>,
    ) -> (String, ItemProgress) {
        let id = format!("w{}", idx);
        (
            id.clone(),
            ItemProgress {
                id: format!("a:s:{}", id),
                assignment_id: "a".to_string(),
                student_id: "s".to_string(),
                item_id: id,
                seen_count: seen,
                correct_count: correct,
                last_seen_at: last_seen,
            },
        )
    }

    #[test]
    fn all_unseen_returns_pool_prefix_in_order() {
        let pool = pool(10);
        let (batch, strategy) = select_session(&pool, &HashMap::new(), 4, Utc::now());

        assert_eq!(strategy, SelectionStrategy::Unseen);
        let indices: Vec<usize> = batch.iter().map(|i| i.original_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn zero_seen_count_counts_as_unseen() {
        let pool = pool(4);
        let now = Utc::now();
        let progress: HashMap<_, _> = vec![progress_for(0, 0, 0, None)].into_iter().collect();

        let (batch, strategy) = select_session(&pool, &progress, 4, now);
        assert_eq!(strategy, SelectionStrategy::Unseen);
        assert_eq!(batch.len(), 4);
        assert_eq!(batch[0].original_index, 0);
    }

    #[test]
    fn partial_fill_takes_all_unseen_plus_weakest_seen() {
        // Pool of 10; indices 2, 5, 9 unseen; the rest seen with varying accuracy.
        let pool = pool(10);
        let now = Utc::now();
        let seen_at = Some(now - Duration::hours(1));

        let mut progress = HashMap::new();
        for (idx, correct) in [(0, 9), (1, 2), (3, 7), (4, 1), (6, 5), (7, 10), (8, 3)] {
            let (id, p) = progress_for(idx, 10, correct, seen_at);
            progress.insert(id, p);
        }

        let (batch, strategy) = select_session(&pool, &progress, 5, now);
        assert_eq!(strategy, SelectionStrategy::Mixed);

        let indices: Vec<usize> = batch.iter().map(|i| i.original_index).collect();
        // Unseen in pool order first, then the two weakest by accuracy
        // ascending (index 4 at 10%, index 1 at 20%).
        assert_eq!(indices, vec![2, 5, 9, 4, 1]);
    }

    #[test]
    fn exhausted_pool_ranks_by_weakness_ascending() {
        let pool = pool(4);
        let now = Utc::now();
        let recent = Some(now - Duration::hours(1));

        let mut progress = HashMap::new();
        // All recently seen, so recency is near zero and accuracy decides.
        for (idx, correct) in [(0, 10), (1, 4), (2, 8), (3, 0)] {
            let (id, p) = progress_for(idx, 10, correct, recent);
            progress.insert(id, p);
        }

        let (batch, strategy) = select_session(&pool, &progress, 2, now);
        assert_eq!(strategy, SelectionStrategy::Review);

        let indices: Vec<usize> = batch.iter().map(|i| i.original_index).collect();
        assert_eq!(indices, vec![3, 1]);

        // Non-decreasing weakness score across the returned batch.
        let scores: Vec<f64> = batch
            .iter()
            .map(|i| weakness_score(i, &progress, now))
            .collect();
        assert!(scores.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn stale_item_outranks_equally_accurate_recent_item() {
        let pool = pool(2);
        let now = Utc::now();

        let mut progress = HashMap::new();
        let (id, p) = progress_for(0, 10, 8, Some(now - Duration::minutes(10)));
        progress.insert(id, p);
        let (id, p) = progress_for(1, 10, 8, Some(now - Duration::days(20)));
        progress.insert(id, p);

        let (batch, _) = select_session(&pool, &progress, 1, now);
        assert_eq!(batch[0].original_index, 1);
    }

    #[test]
    fn missing_last_seen_is_maximally_stale() {
        let pool = pool(2);
        let now = Utc::now();

        let mut progress = HashMap::new();
        // Same accuracy; item 0 has a timestamp, item 1 never got one.
        let (id, p) = progress_for(0, 10, 5, Some(now - Duration::days(40)));
        progress.insert(id, p);
        let (id, p) = progress_for(1, 10, 5, None);
        progress.insert(id, p);

        // Both saturate at the horizon, so the tie falls back to pool order.
        let (batch, _) = select_session(&pool, &progress, 2, now);
        let indices: Vec<usize> = batch.iter().map(|i| i.original_index).collect();
        assert_eq!(indices, vec![0, 1]);

        assert_eq!(normalized_recency(&item(1), &progress, now), 1.0);
    }

    #[test]
    fn recency_is_clamped_to_accuracy_range() {
        let now = Utc::now();
        let mut progress = HashMap::new();
        let (id, p) = progress_for(0, 1, 0, Some(now - Duration::days(365)));
        progress.insert(id, p);

        let r = normalized_recency(&item(0), &progress, now);
        assert_eq!(r, 1.0);

        let (id, p) = progress_for(1, 1, 0, Some(now + Duration::hours(1)));
        progress.insert(id, p);
        // Clock skew: a future stamp clamps to zero rather than going negative.
        assert_eq!(normalized_recency(&item(1), &progress, now), 0.0);
    }

    #[test]
    fn oversized_request_returns_whole_pool() {
        let pool = pool(3);
        let (batch, _) = select_session(&pool, &HashMap::new(), 50, Utc::now());
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn selection_is_deterministic() {
        let pool = pool(8);
        let now = Utc::now();
        let seen_at = Some(now - Duration::hours(3));

        let mut progress = HashMap::new();
        for idx in 0..8 {
            let (id, p) = progress_for(idx, 5, (idx % 4) as u32, seen_at);
            progress.insert(id, p);
        }

        let first = select_session(&pool, &progress, 4, now);
        let second = select_session(&pool, &progress, 4, now);
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }

    #[test]
    fn pool_order_prefix_respects_original_index() {
        let mut shuffled = pool(5);
        shuffled.reverse();
        let prefix = pool_order_prefix(&shuffled, 2);
        let indices: Vec<usize> = prefix.iter().map(|i| i.original_index).collect();
        assert_eq!(indices, vec![0, 1]);
    }
}
