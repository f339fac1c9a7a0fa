//! Course directory: maps room keys to courses and answers enrollment checks.
//!
//! # Security
//!
//! - All queries use parameterized statements
//! - Participant identifiers are not logged at info level

use crate::errors::RcError;
use crate::observability::metrics as prom;

use async_trait::async_trait;
use common::types::{ParticipantId, RoomKey};
use sqlx::PgPool;
use std::time::Instant;
use tracing::instrument;

/// Lifecycle of the course session behind a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Scheduled,
    Live,
    Completed,
}

impl SessionStatus {
    /// Parse a stored status. Anything that is neither scheduled nor live is
    /// treated as over (completed, cancelled, archived).
    #[must_use]
    pub fn from_db(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("live") {
            SessionStatus::Live
        } else if raw.eq_ignore_ascii_case("scheduled") {
            SessionStatus::Scheduled
        } else {
            SessionStatus::Completed
        }
    }
}

/// The course session a room key resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourseSession {
    pub course_id: String,
    pub status: SessionStatus,
}

#[async_trait]
pub trait CourseDirectory: Send + Sync {
    /// Resolve a room key, or `None` when no course owns it.
    async fn resolve_room(&self, room_key: &RoomKey) -> Result<Option<CourseSession>, RcError>;

    async fn is_enrolled(
        &self,
        participant_id: &ParticipantId,
        course_id: &str,
    ) -> Result<bool, RcError>;
}

/// Postgres-backed directory over the platform's scheduling tables.
#[derive(Clone)]
pub struct PgCourseDirectory {
    pool: PgPool,
}

impl PgCourseDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    class_id: String,
    status: String,
}

fn directory_error(operation: &'static str, started: Instant, e: &sqlx::Error) -> RcError {
    prom::record_directory_query(operation, "error", started.elapsed());
    tracing::error!(target: "rc.directory", operation, error = %e, "Directory query failed");
    RcError::Directory(e.to_string())
}

#[async_trait]
impl CourseDirectory for PgCourseDirectory {
    #[instrument(skip_all, fields(room_key = %room_key))]
    async fn resolve_room(&self, room_key: &RoomKey) -> Result<Option<CourseSession>, RcError> {
        let started = Instant::now();
        let row: Option<ScheduleRow> = sqlx::query_as(
            r#"
            SELECT class_id::TEXT AS class_id, status::TEXT AS status
            FROM class_schedules
            WHERE meeting_room_id = $1
            ORDER BY CASE WHEN LOWER(status::TEXT) = 'live' THEN 0 ELSE 1 END
            LIMIT 1
            "#,
        )
        .bind(room_key.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| directory_error("resolve_room", started, &e))?;

        prom::record_directory_query("resolve_room", "success", started.elapsed());
        Ok(row.map(|r| CourseSession {
            status: SessionStatus::from_db(&r.status),
            course_id: r.class_id,
        }))
    }

    #[instrument(skip_all, fields(course_id = %course_id))]
    async fn is_enrolled(
        &self,
        participant_id: &ParticipantId,
        course_id: &str,
    ) -> Result<bool, RcError> {
        let started = Instant::now();
        let enrolled: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM enrollments
                WHERE student_id::TEXT = $1 AND class_id::TEXT = $2
            )
            "#,
        )
        .bind(participant_id.as_str())
        .bind(course_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| directory_error("is_enrolled", started, &e))?;

        prom::record_directory_query("is_enrolled", "success", started.elapsed());
        Ok(enrolled)
    }
}
