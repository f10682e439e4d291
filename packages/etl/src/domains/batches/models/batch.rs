//! Batch tracking records.
//!
//! One row per generated batch artifact, in a per-domain table
//! (`workplace_batches`, `location_batches`, `embedding_batches`) of
//! identical shape. Unlike job status, batch status is a strict one-way
//! state machine with no cycles: `pending` → `submitted` → terminal.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::decode::Decode;
use sqlx::encode::{Encode, IsNull};
use sqlx::error::BoxDynError;
use sqlx::postgres::{PgArgumentBuffer, PgTypeInfo, PgValueRef};
use sqlx::{PgPool, Postgres, Type};
use thiserror::Error;
use uuid::Uuid;

/// Local lifecycle of one outstanding unit of remote batch work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    /// Artifact written locally, not yet uploaded
    Pending,
    /// Remote batch created; awaiting completion
    Submitted,
    /// Results downloaded locally
    Completed,
    /// Submission failed, or the remote batch failed
    Failed,
    /// The remote batch expired before completing
    Expired,
    /// The remote batch was cancelled
    Cancelled,
}

#[derive(Debug, Error)]
#[error("unknown batch status: {0:?}")]
pub struct UnknownBatchStatus(String);

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Submitted => "submitted",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Expired => "expired",
            BatchStatus::Cancelled => "cancelled",
        }
    }

    /// Strict forward-only edges; terminal states have none.
    pub fn can_transition_to(&self, to: BatchStatus) -> bool {
        use BatchStatus::*;

        matches!(
            (self, to),
            (Pending, Submitted) | (Pending, Failed)
                | (Submitted, Completed)
                | (Submitted, Failed)
                | (Submitted, Expired)
                | (Submitted, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::Pending | BatchStatus::Submitted)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = UnknownBatchStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "submitted" => Ok(BatchStatus::Submitted),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            "expired" => Ok(BatchStatus::Expired),
            "cancelled" => Ok(BatchStatus::Cancelled),
            other => Err(UnknownBatchStatus(other.to_string())),
        }
    }
}

impl Type<Postgres> for BatchStatus {
    fn type_info() -> PgTypeInfo {
        <&str as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <&str as Type<Postgres>>::compatible(ty)
    }
}

impl<'q> Encode<'q, Postgres> for BatchStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        <&str as Encode<'q, Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

impl<'r> Decode<'r, Postgres> for BatchStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as Decode<'r, Postgres>>::decode(value)?;
        Ok(s.parse::<BatchStatus>()?)
    }
}

/// A batch tracking row. The owning table is passed per call because the
/// three per-domain tables share this exact shape.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EnrichmentBatch {
    pub id: Uuid,
    pub file_id: Option<Uuid>,
    pub batch_file_path: String,
    pub openai_input_file_id: Option<String>,
    pub openai_batch_id: Option<String>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl EnrichmentBatch {
    /// Create a `pending` tracking row for a freshly written artifact.
    pub async fn insert<'e, E>(
        table: &'static str,
        id: Uuid,
        file_id: Option<Uuid>,
        batch_file_path: &str,
        executor: E,
    ) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "INSERT INTO {table} (id, file_id, batch_file_path, status, created_at) \
             VALUES ($1, $2, $3, $4, NOW())"
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(file_id)
            .bind(batch_file_path)
            .bind(BatchStatus::Pending)
            .execute(executor)
            .await?;
        Ok(())
    }

    /// How many batches currently sit at the given status.
    pub async fn count_in_status(
        table: &'static str,
        status: BatchStatus,
        pool: &PgPool,
    ) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {table} WHERE status = $1");
        let (count,): (i64,) = sqlx::query_as(&sql).bind(status).fetch_one(pool).await?;
        Ok(count)
    }

    /// Pending batches, oldest first, capped at `limit`.
    pub async fn find_pending(table: &'static str, limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        let sql = format!(
            "SELECT * FROM {table} WHERE status = $1 ORDER BY created_at ASC LIMIT $2"
        );
        let batches = sqlx::query_as::<_, Self>(&sql)
            .bind(BatchStatus::Pending)
            .bind(limit)
            .fetch_all(pool)
            .await?;
        Ok(batches)
    }

    /// All batches awaiting a remote verdict.
    pub async fn find_submitted(table: &'static str, pool: &PgPool) -> Result<Vec<Self>> {
        let sql = format!("SELECT * FROM {table} WHERE status = $1 ORDER BY created_at ASC");
        let batches = sqlx::query_as::<_, Self>(&sql)
            .bind(BatchStatus::Submitted)
            .fetch_all(pool)
            .await?;
        Ok(batches)
    }

    /// Record the remote handles and advance `pending` → `submitted`.
    pub async fn mark_submitted(
        table: &'static str,
        id: Uuid,
        input_file_id: &str,
        batch_id: &str,
        pool: &PgPool,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {table} \
             SET openai_input_file_id = $2, openai_batch_id = $3, status = $4, submitted_at = NOW() \
             WHERE id = $1 AND status = $5"
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(input_file_id)
            .bind(batch_id)
            .bind(BatchStatus::Submitted)
            .bind(BatchStatus::Pending)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Advance `submitted` → `completed` once results are safely on disk.
    pub async fn mark_completed(table: &'static str, id: Uuid, pool: &PgPool) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET status = $2, completed_at = NOW() WHERE id = $1 AND status = $3"
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(BatchStatus::Completed)
            .bind(BatchStatus::Submitted)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Record a terminal failure (`failed`, `expired`, or `cancelled`).
    pub async fn mark_terminal(
        table: &'static str,
        id: Uuid,
        status: BatchStatus,
        error_message: &str,
        pool: &PgPool,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET status = $2, error_message = $3 \
             WHERE id = $1 AND status IN ('pending', 'submitted')"
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(status)
            .bind(error_message)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// The artifact filename, used as the remote deduplication key.
    pub fn artifact_filename(&self) -> &str {
        std::path::Path::new(&self.batch_file_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.batch_file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::BatchStatus::*;
    use super::*;

    const ALL: [BatchStatus; 6] = [Pending, Submitted, Completed, Failed, Expired, Cancelled];

    #[test]
    fn wire_strings_round_trip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<BatchStatus>().unwrap(), status);
        }
    }

    #[test]
    fn lifecycle_is_acyclic() {
        // No status may transition (even transitively) back to itself.
        for start in ALL {
            let mut reachable = vec![start];
            let mut frontier = vec![start];
            while let Some(from) = frontier.pop() {
                for to in ALL {
                    if from.can_transition_to(to) && !reachable.contains(&to) {
                        assert_ne!(to, start, "cycle through {}", start);
                        reachable.push(to);
                        frontier.push(to);
                    }
                }
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to));
            }
        }
    }

    #[test]
    fn pending_cannot_complete_without_submission() {
        assert!(!Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Completed));
    }

    #[test]
    fn artifact_filename_strips_the_directory() {
        let batch = EnrichmentBatch {
            id: Uuid::new_v4(),
            file_id: None,
            batch_file_path: "/data/llmbatch/workplace_batch_x.jsonl".to_string(),
            openai_input_file_id: None,
            openai_batch_id: None,
            status: Pending,
            created_at: Utc::now(),
            submitted_at: None,
            completed_at: None,
            error_message: None,
        };

        assert_eq!(batch.artifact_filename(), "workplace_batch_x.jsonl");
    }
}
