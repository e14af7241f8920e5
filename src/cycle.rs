use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::fmt;
use uuid::Uuid;

use crate::errors::{AppResult, DatabaseError};

/// Stages of the capture-generate-print state machine. `Idle` is the
/// device-level state between cycles; an accepted trigger enters
/// `Capturing` immediately. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Capturing,
    Generating,
    Printing,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Capturing => "capturing",
            Stage::Generating => "generating",
            Stage::Printing => "printing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "idle" => Ok(Stage::Idle),
            "capturing" => Ok(Stage::Capturing),
            "generating" => Ok(Stage::Generating),
            "printing" => Ok(Stage::Printing),
            "done" => Ok(Stage::Done),
            "failed" => Ok(Stage::Failed),
            other => Err(DatabaseError::QueryFailed(format!(
                "unknown stage value: {other}"
            ))),
        }
    }

    fn order(&self) -> u8 {
        match self {
            Stage::Idle => 0,
            Stage::Capturing => 1,
            Stage::Generating => 2,
            Stage::Printing => 3,
            Stage::Done | Stage::Failed => 4,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which stage a failed cycle died in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Capture,
    Generation,
    Print,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Capture => "capture_error",
            FailureReason::Generation => "generation_error",
            FailureReason::Print => "print_error",
        }
    }

    fn parse(s: &str) -> Result<Self, DatabaseError> {
        match s {
            "capture_error" => Ok(FailureReason::Capture),
            "generation_error" => Ok(FailureReason::Generation),
            "print_error" => Ok(FailureReason::Print),
            other => Err(DatabaseError::QueryFailed(format!(
                "unknown failure reason: {other}"
            ))),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal result of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Failed(FailureReason),
}

/// The unit of work for one trigger event. Created on trigger
/// acceptance, mutated only by the orchestrator, archived on reaching a
/// terminal state.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub id: Uuid,
    /// Print serial number, shown on the slip header.
    pub serial: i64,
    pub created_at: DateTime<Utc>,
    pub stage: Stage,
    pub stage_entered_at: DateTime<Utc>,
    pub capture_attempts: u32,
    pub generation_attempts: u32,
    pub print_attempts: u32,
    pub outcome: Option<Outcome>,
    pub image_path: Option<String>,
    pub poem_path: Option<String>,
}

impl Cycle {
    pub fn new(serial: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            serial,
            created_at: now,
            stage: Stage::Capturing,
            stage_entered_at: now,
            capture_attempts: 0,
            generation_attempts: 0,
            print_attempts: 0,
            outcome: None,
            image_path: None,
            poem_path: None,
        }
    }

    /// Move forward to the next stage. Backward transitions are a
    /// programming error.
    pub fn advance(&mut self, next: Stage) {
        debug_assert!(
            next.order() > self.stage.order(),
            "cycle {} cannot move from {} back to {}",
            self.id,
            self.stage,
            next
        );
        self.stage = next;
        self.stage_entered_at = Utc::now();
    }

    pub fn complete(&mut self) {
        self.advance(Stage::Done);
        self.outcome = Some(Outcome::Done);
    }

    pub fn fail(&mut self, reason: FailureReason) {
        self.advance(Stage::Failed);
        self.outcome = Some(Outcome::Failed(reason));
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    pub async fn save(&self, pool: &SqlitePool) -> AppResult<()> {
        let (outcome, failure_reason) = outcome_columns(self.outcome);
        sqlx::query(
            r#"
            INSERT INTO cycle (
                id, serial, created_at, stage, stage_entered_at,
                capture_attempts, generation_attempts, print_attempts,
                outcome, failure_reason, image_path, poem_path
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12
            )
            "#,
        )
        .bind(self.id.to_string())
        .bind(self.serial)
        .bind(self.created_at.to_rfc3339())
        .bind(self.stage.as_str())
        .bind(self.stage_entered_at.to_rfc3339())
        .bind(i64::from(self.capture_attempts))
        .bind(i64::from(self.generation_attempts))
        .bind(i64::from(self.print_attempts))
        .bind(outcome)
        .bind(failure_reason)
        .bind(&self.image_path)
        .bind(&self.poem_path)
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::QueryFailed(format!("Failed to save cycle: {e}")))?;

        Ok(())
    }

    pub async fn update(&self, pool: &SqlitePool) -> AppResult<()> {
        let (outcome, failure_reason) = outcome_columns(self.outcome);
        sqlx::query(
            r#"
            UPDATE cycle SET
                stage = ?2,
                stage_entered_at = ?3,
                capture_attempts = ?4,
                generation_attempts = ?5,
                print_attempts = ?6,
                outcome = ?7,
                failure_reason = ?8,
                image_path = ?9,
                poem_path = ?10
            WHERE id = ?1
            "#,
        )
        .bind(self.id.to_string())
        .bind(self.stage.as_str())
        .bind(self.stage_entered_at.to_rfc3339())
        .bind(i64::from(self.capture_attempts))
        .bind(i64::from(self.generation_attempts))
        .bind(i64::from(self.print_attempts))
        .bind(outcome)
        .bind(failure_reason)
        .bind(&self.image_path)
        .bind(&self.poem_path)
        .execute(pool)
        .await
        .map_err(|e| DatabaseError::QueryFailed(format!("Failed to update cycle: {e}")))?;

        Ok(())
    }

    pub async fn load(id: Uuid, pool: &SqlitePool) -> AppResult<Option<Self>> {
        let row = sqlx::query_as::<_, CycleRow>(
            r#"
            SELECT
                id, serial, created_at, stage, stage_entered_at,
                capture_attempts, generation_attempts, print_attempts,
                outcome, failure_reason, image_path, poem_path
            FROM cycle
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(pool)
        .await
        .map_err(|e| DatabaseError::QueryFailed(format!("Failed to load cycle: {e}")))?;

        row.map(Cycle::try_from).transpose().map_err(Into::into)
    }

    /// Number of archived cycles; the next print serial is count + 1.
    pub async fn count(pool: &SqlitePool) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cycle")
            .fetch_one(pool)
            .await
            .map_err(|e| DatabaseError::QueryFailed(format!("Failed to count cycles: {e}")))?;
        Ok(count)
    }

    pub async fn find_recent(limit: i64, pool: &SqlitePool) -> AppResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, CycleRow>(
            r#"
            SELECT
                id, serial, created_at, stage, stage_entered_at,
                capture_attempts, generation_attempts, print_attempts,
                outcome, failure_reason, image_path, poem_path
            FROM cycle
            ORDER BY created_at DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(|e| DatabaseError::QueryFailed(format!("Failed to list cycles: {e}")))?;

        rows.into_iter()
            .map(|row| Cycle::try_from(row).map_err(Into::into))
            .collect()
    }
}

fn outcome_columns(outcome: Option<Outcome>) -> (Option<&'static str>, Option<&'static str>) {
    match outcome {
        None => (None, None),
        Some(Outcome::Done) => (Some("done"), None),
        Some(Outcome::Failed(reason)) => (Some("failed"), Some(reason.as_str())),
    }
}

#[derive(Debug, FromRow)]
struct CycleRow {
    id: String,
    serial: i64,
    created_at: String,
    stage: String,
    stage_entered_at: String,
    capture_attempts: i64,
    generation_attempts: i64,
    print_attempts: i64,
    outcome: Option<String>,
    failure_reason: Option<String>,
    image_path: Option<String>,
    poem_path: Option<String>,
}

impl TryFrom<CycleRow> for Cycle {
    type Error = DatabaseError;

    fn try_from(row: CycleRow) -> Result<Self, Self::Error> {
        let outcome = match (row.outcome.as_deref(), row.failure_reason.as_deref()) {
            (None, _) => None,
            (Some("done"), _) => Some(Outcome::Done),
            (Some("failed"), Some(reason)) => {
                Some(Outcome::Failed(FailureReason::parse(reason)?))
            }
            (Some(other), _) => {
                return Err(DatabaseError::QueryFailed(format!(
                    "unknown outcome value: {other}"
                )))
            }
        };

        Ok(Cycle {
            id: parse_uuid(&row.id)?,
            serial: row.serial,
            created_at: parse_timestamp(&row.created_at)?,
            stage: Stage::parse(&row.stage)?,
            stage_entered_at: parse_timestamp(&row.stage_entered_at)?,
            capture_attempts: parse_attempts(row.capture_attempts)?,
            generation_attempts: parse_attempts(row.generation_attempts)?,
            print_attempts: parse_attempts(row.print_attempts)?,
            outcome,
            image_path: row.image_path,
            poem_path: row.poem_path,
        })
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(raw)
        .map_err(|e| DatabaseError::QueryFailed(format!("invalid cycle id {raw}: {e}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DatabaseError::QueryFailed(format!("invalid timestamp {raw}: {e}")))
}

fn parse_attempts(raw: i64) -> Result<u32, DatabaseError> {
    u32::try_from(raw)
        .map_err(|_| DatabaseError::QueryFailed(format!("attempt count out of range: {raw}")))
}
