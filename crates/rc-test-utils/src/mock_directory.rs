//! In-memory course directory.

use async_trait::async_trait;
use common::types::{ParticipantId, RoomKey};
use room_controller::directory::{CourseDirectory, CourseSession, SessionStatus};
use room_controller::errors::RcError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Inner {
    rooms: HashMap<String, CourseSession>,
    enrollments: HashSet<(String, String)>,
    failing: bool,
    lookups: usize,
}

/// Course directory backed by maps. Clones share state, so a test can flip
/// a session's status while the rig holds another clone.
#[derive(Debug, Clone, Default)]
pub struct MockDirectory {
    inner: Arc<Mutex<Inner>>,
}

impl MockDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `room_key` to `course_id` with the given session status.
    pub fn with_room(self, room_key: &str, course_id: &str, status: SessionStatus) -> Self {
        self.inner.lock().unwrap().rooms.insert(
            room_key.to_string(),
            CourseSession {
                course_id: course_id.to_string(),
                status,
            },
        );
        self
    }

    pub fn with_enrollment(self, participant: &str, course_id: &str) -> Self {
        self.inner
            .lock()
            .unwrap()
            .enrollments
            .insert((participant.to_string(), course_id.to_string()));
        self
    }

    /// Change the status of an already mapped room.
    pub fn set_status(&self, room_key: &str, status: SessionStatus) {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .rooms
            .get_mut(room_key)
            .unwrap_or_else(|| panic!("room {room_key} is not mapped"));
        session.status = status;
    }

    /// Make every lookup fail as if the database were down.
    pub fn set_failing(&self, failing: bool) {
        self.inner.lock().unwrap().failing = failing;
    }

    /// Number of `resolve_room` calls so far.
    pub fn lookups(&self) -> usize {
        self.inner.lock().unwrap().lookups
    }
}

#[async_trait]
impl CourseDirectory for MockDirectory {
    async fn resolve_room(&self, room_key: &RoomKey) -> Result<Option<CourseSession>, RcError> {
        let mut inner = self.inner.lock().unwrap();
        inner.lookups += 1;
        if inner.failing {
            return Err(RcError::Directory("mock directory unavailable".to_string()));
        }
        Ok(inner.rooms.get(room_key.as_str()).cloned())
    }

    async fn is_enrolled(
        &self,
        participant_id: &ParticipantId,
        course_id: &str,
    ) -> Result<bool, RcError> {
        let inner = self.inner.lock().unwrap();
        if inner.failing {
            return Err(RcError::Directory("mock directory unavailable".to_string()));
        }
        Ok(inner
            .enrollments
            .contains(&(participant_id.as_str().to_string(), course_id.to_string())))
    }
}
