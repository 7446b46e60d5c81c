use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mongodb::bson::doc;
use mongodb::Database;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::metrics::{
    record_cache_hit, record_cache_miss, track_cache_operation, track_db_operation,
    BEST_EFFORT_WRITE_FAILURES_TOTAL, EXPOSURES_RECORDED_TOTAL, SESSION_RESULTS_RECORDED_TOTAL,
};
use crate::models::session::{RecordExposureRequest, RecordSessionRequest, RecordSessionResponse};
use crate::models::{GameMetricsRecord, GameStatusRecord, ItemProgress, SessionHistoryRecord};
use crate::utils::retry::{with_backoff, RetryPolicy};
use crate::utils::time::chrono_to_bson;

use super::{CACHE_TIMEOUT, STORE_TIMEOUT};

const IDEMPOTENCY_TTL_SECONDS: u32 = 86400;

/// Storage surface for the recorder's three views. The write sequencing in
/// [`write_session_views`] is defined over this trait so the tier rules hold
/// independent of the backing store.
pub(crate) trait SessionViewStore {
    async fn replace_status(&self, record: &GameStatusRecord) -> Result<()>;
    async fn append_history(&self, record: &SessionHistoryRecord) -> Result<()>;
    async fn upsert_metrics(&self, req: &RecordSessionRequest, now: DateTime<Utc>) -> Result<()>;
}

/// Writes the three views in reliability order. The status view is the only
/// write that may fail the call: it is retried and a final failure aborts
/// before the other views are touched. History and metrics are best-effort;
/// their failures are logged and counted, never surfaced.
pub(crate) async fn write_session_views<S: SessionViewStore>(
    store: &S,
    req: &RecordSessionRequest,
    now: DateTime<Utc>,
) -> Result<RecordSessionResponse> {
    let status = GameStatusRecord {
        id: GameStatusRecord::compound_id(&req.assignment_id, &req.student_id, &req.game_id),
        assignment_id: req.assignment_id.clone(),
        student_id: req.student_id.clone(),
        game_id: req.game_id.clone(),
        completed: req.completed,
        score: req.score,
        accuracy: req.accuracy,
        duration_seconds: req.duration_seconds,
        items_attempted: req.items_attempted(),
        items_correct: req.items_correct(),
        updated_at: now,
    };
    with_backoff(RetryPolicy::load_bearing(), || store.replace_status(&status)).await?;

    let history = SessionHistoryRecord {
        id: Uuid::new_v4().to_string(),
        assignment_id: req.assignment_id.clone(),
        student_id: req.student_id.clone(),
        game_id: req.game_id.clone(),
        mode: req.mode,
        completed: req.completed,
        score: req.score,
        accuracy: req.accuracy,
        duration_seconds: req.duration_seconds,
        items_attempted: req.items_attempted(),
        items_correct: req.items_correct(),
        recorded_at: now,
    };
    if let Err(e) = store.append_history(&history).await {
        BEST_EFFORT_WRITE_FAILURES_TOTAL
            .with_label_values(&["history"])
            .inc();
        tracing::warn!(
            assignment_id = %req.assignment_id,
            student_id = %req.student_id,
            game_id = %req.game_id,
            error = %e,
            "History append failed, status view already updated"
        );
    }

    if let Err(e) = store.upsert_metrics(req, now).await {
        BEST_EFFORT_WRITE_FAILURES_TOTAL
            .with_label_values(&["metrics"])
            .inc();
        tracing::warn!(
            assignment_id = %req.assignment_id,
            student_id = %req.student_id,
            game_id = %req.game_id,
            error = %e,
            "Metrics upsert failed, status view already updated"
        );
    }

    SESSION_RESULTS_RECORDED_TOTAL
        .with_label_values(&[if req.completed { "true" } else { "false" }])
        .inc();

    Ok(RecordSessionResponse {
        assignment_id: req.assignment_id.clone(),
        student_id: req.student_id.clone(),
        game_id: req.game_id.clone(),
        completed: req.completed,
        items_attempted: req.items_attempted(),
        items_correct: req.items_correct(),
    })
}

struct MongoSessionViews {
    mongo: Database,
}

impl SessionViewStore for MongoSessionViews {
    async fn replace_status(&self, record: &GameStatusRecord) -> Result<()> {
        let collection = self
            .mongo
            .collection::<GameStatusRecord>("assignment_game_status");

        track_db_operation("replace", "assignment_game_status", async {
            tokio::time::timeout(
                STORE_TIMEOUT,
                collection
                    .replace_one(doc! { "_id": &record.id }, record)
                    .upsert(true),
            )
            .await
            .context("assignment_game_status replace timed out")?
            .context("Failed to replace assignment_game_status")
        })
        .await?;

        Ok(())
    }

    async fn append_history(&self, record: &SessionHistoryRecord) -> Result<()> {
        let collection = self
            .mongo
            .collection::<SessionHistoryRecord>("session_history");

        track_db_operation("insert", "session_history", async {
            tokio::time::timeout(STORE_TIMEOUT, collection.insert_one(record))
                .await
                .context("session_history insert timed out")?
                .context("Failed to insert session_history")
        })
        .await?;

        Ok(())
    }

    /// `$max` keeps the best-score fields monotone, which also makes the
    /// write idempotent for a replayed payload.
    async fn upsert_metrics(&self, req: &RecordSessionRequest, now: DateTime<Utc>) -> Result<()> {
        let collection = self
            .mongo
            .collection::<GameMetricsRecord>("assignment_game_metrics");
        let id = GameStatusRecord::compound_id(&req.assignment_id, &req.student_id, &req.game_id);

        let update = doc! {
            "$max": {
                "best_score": req.score,
                "best_accuracy": req.accuracy,
            },
            "$set": {
                "last_played_at": chrono_to_bson(now),
                "updated_at": chrono_to_bson(now),
            },
            "$setOnInsert": {
                "assignment_id": &req.assignment_id,
                "student_id": &req.student_id,
                "game_id": &req.game_id,
            },
        };

        track_db_operation("update", "assignment_game_metrics", async {
            tokio::time::timeout(
                STORE_TIMEOUT,
                collection
                    .update_one(doc! { "_id": &id }, update)
                    .upsert(true),
            )
            .await
            .context("assignment_game_metrics upsert timed out")?
            .context("Failed to upsert assignment_game_metrics")
        })
        .await?;

        Ok(())
    }
}

/// Records session results and item exposures.
pub struct RecorderService {
    mongo: Database,
    redis: ConnectionManager,
}

impl RecorderService {
    pub fn new(mongo: Database, redis: ConnectionManager) -> Self {
        Self { mongo, redis }
    }

    pub async fn record_session(
        &self,
        req: &RecordSessionRequest,
    ) -> Result<RecordSessionResponse> {
        if let Some(key) = req.idempotency_key.as_deref() {
            // Cache trouble must not block recording; fall through on error.
            match self.check_idempotency(key).await {
                Ok(Some(cached)) => {
                    record_cache_hit();
                    tracing::info!(idempotency_key = key, "Returning cached session result");
                    return Ok(cached);
                }
                Ok(None) => record_cache_miss(),
                Err(e) => {
                    tracing::warn!(idempotency_key = key, error = %e, "Idempotency check degraded");
                }
            }
        }

        let store = MongoSessionViews {
            mongo: self.mongo.clone(),
        };
        let response = write_session_views(&store, req, Utc::now()).await?;

        if let Some(key) = req.idempotency_key.as_deref() {
            if let Err(e) = self.cache_response(key, &response).await {
                tracing::warn!(idempotency_key = key, error = %e, "Failed to cache session result");
            }
        }

        Ok(response)
    }

    /// Records a single item exposure as one atomic upsert. Concurrent
    /// exposures of the same item each land their own `$inc`; no
    /// read-modify-write window exists.
    pub async fn record_item_exposure(&self, req: &RecordExposureRequest) -> Result<()> {
        let collection = self.mongo.collection::<ItemProgress>("item_progress");
        let id = ItemProgress::compound_id(&req.assignment_id, &req.student_id, &req.item_id);
        let now = Utc::now();

        let update = doc! {
            "$inc": {
                "seen_count": 1,
                "correct_count": if req.correct { 1 } else { 0 },
            },
            "$set": { "last_seen_at": chrono_to_bson(now) },
            "$setOnInsert": {
                "assignment_id": &req.assignment_id,
                "student_id": &req.student_id,
                "item_id": &req.item_id,
            },
        };

        track_db_operation("update", "item_progress", async {
            tokio::time::timeout(
                STORE_TIMEOUT,
                collection
                    .update_one(doc! { "_id": &id }, update)
                    .upsert(true),
            )
            .await
            .context("item_progress upsert timed out")?
            .context("Failed to upsert item_progress")
        })
        .await?;

        EXPOSURES_RECORDED_TOTAL
            .with_label_values(&[if req.correct { "true" } else { "false" }])
            .inc();

        Ok(())
    }

    async fn check_idempotency(&self, key: &str) -> Result<Option<RecordSessionResponse>> {
        let mut conn = self.redis.clone();
        let cache_key = format!("idempotency:session:{}", key);

        let cached: Option<String> = track_cache_operation("get", async {
            tokio::time::timeout(
                CACHE_TIMEOUT,
                redis::cmd("GET").arg(&cache_key).query_async(&mut conn),
            )
            .await
            .context("Idempotency check timed out")?
            .context("Failed to check idempotency cache")
        })
        .await?;

        match cached {
            Some(json) => {
                let response: RecordSessionResponse =
                    serde_json::from_str(&json).context("Failed to deserialize cached response")?;
                Ok(Some(response))
            }
            None => Ok(None),
        }
    }

    async fn cache_response(&self, key: &str, response: &RecordSessionResponse) -> Result<()> {
        let mut conn = self.redis.clone();
        let cache_key = format!("idempotency:session:{}", key);
        let json = serde_json::to_string(response).context("Failed to serialize response")?;

        track_cache_operation("setex", async {
            tokio::time::timeout(
                CACHE_TIMEOUT,
                redis::cmd("SETEX")
                    .arg(&cache_key)
                    .arg(IDEMPOTENCY_TTL_SECONDS)
                    .arg(&json)
                    .query_async::<()>(&mut conn),
            )
            .await
            .context("Response caching timed out")?
            .context("Failed to cache response")
        })
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionMode;
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryViews {
        fail_status: bool,
        fail_history: bool,
        fail_metrics: bool,
        status: Mutex<HashMap<String, GameStatusRecord>>,
        history: Mutex<Vec<SessionHistoryRecord>>,
        metrics_writes: AtomicU32,
    }

    impl SessionViewStore for MemoryViews {
        async fn replace_status(&self, record: &GameStatusRecord) -> Result<()> {
            if self.fail_status {
                anyhow::bail!("status store down");
            }
            self.status
                .lock()
                .unwrap()
                .insert(record.id.clone(), record.clone());
            Ok(())
        }

        async fn append_history(&self, record: &SessionHistoryRecord) -> Result<()> {
            if self.fail_history {
                anyhow::bail!("history store down");
            }
            self.history.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn upsert_metrics(
            &self,
            _req: &RecordSessionRequest,
            _now: DateTime<Utc>,
        ) -> Result<()> {
            if self.fail_metrics {
                anyhow::bail!("metrics store down");
            }
            self.metrics_writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request() -> RecordSessionRequest {
        RecordSessionRequest {
            assignment_id: "a1".to_string(),
            student_id: "s1".to_string(),
            game_id: "hangman".to_string(),
            mode: SessionMode::Assignment,
            completed: true,
            score: 120,
            accuracy: 85.0,
            duration_seconds: 240,
            outcomes: vec![],
            idempotency_key: None,
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 2, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn repeated_recording_keeps_status_stable_and_appends_history() {
        let store = MemoryViews::default();
        let req = request();
        let now = fixed_now();

        write_session_views(&store, &req, now).await.unwrap();
        let first = store
            .status
            .lock()
            .unwrap()
            .get("a1:s1:hangman")
            .cloned()
            .unwrap();

        write_session_views(&store, &req, now).await.unwrap();

        let status = store.status.lock().unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status.get("a1:s1:hangman").unwrap(), &first);
        assert_eq!(store.history.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn status_failure_aborts_before_best_effort_views() {
        let store = MemoryViews {
            fail_status: true,
            ..Default::default()
        };

        let result = write_session_views(&store, &request(), fixed_now()).await;

        assert!(result.is_err());
        assert!(store.history.lock().unwrap().is_empty());
        assert_eq!(store.metrics_writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn history_failure_does_not_fail_the_call() {
        let store = MemoryViews {
            fail_history: true,
            ..Default::default()
        };

        let response = write_session_views(&store, &request(), fixed_now())
            .await
            .unwrap();

        assert!(response.completed);
        assert_eq!(store.status.lock().unwrap().len(), 1);
        assert_eq!(store.metrics_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn metrics_failure_does_not_fail_the_call() {
        let store = MemoryViews {
            fail_metrics: true,
            ..Default::default()
        };

        let response = write_session_views(&store, &request(), fixed_now())
            .await
            .unwrap();

        assert_eq!(response.items_attempted, 0);
        assert_eq!(store.status.lock().unwrap().len(), 1);
        assert_eq!(store.history.lock().unwrap().len(), 1);
    }
}
