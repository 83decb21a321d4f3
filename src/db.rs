//! The two downstream databases (spec §6) modeled as opaque collaborators:
//! an "alert DB" holding the deduplicated `Event`/`Notice` stream, and an
//! "observation DB" holding `Survey`/`Target`/`ExposureSet`/`Strategy`/
//! `User`/`GridTile`. Per spec §1 and §9 ("Skymap and DB as collaborators ->
//! opaque handles"), this crate does not implement a real relational schema
//! — [`AlertDb`] and [`ObsDb`] expose exactly the operations spec §6 lists,
//! and [`InMemoryAlertDb`]/[`InMemoryObsDb`] are a default backing store
//! good enough to run the sentinel and its tests against. A deployment
//! wanting a real Postgres-backed store implements the same two traits.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::notice::Notice;
use crate::strategy::{Constraints, ExposureSet as StrategyExposureSet};

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("duplicate IVORN: {0}")]
    DuplicateIvorn(String),
    #[error("no such event: {0}")]
    NoSuchEvent(String),
    #[error("no such survey: {0}")]
    NoSuchSurvey(String),
    #[error("no such target: {0}")]
    NoSuchTarget(u64),
    #[error("transient storage error: {0}")]
    Transient(String),
}

pub type EventId = u64;
pub type NoticeRowId = u64;
pub type SurveyId = u64;
pub type TargetId = u64;
pub type UserId = u64;

/// One stored alert-DB `Notice` row, carrying just enough of the original
/// payload for the handler's change-detection step (spec §4.6 step 3):
/// skymap identity and the strategy key that was decided for it.
#[derive(Debug, Clone)]
pub struct StoredNotice {
    pub row_id: NoticeRowId,
    pub ivorn: String,
    pub time: DateTime<Utc>,
    pub skymap_content_id: Option<u64>,
    pub strategy_key: Option<String>,
    pub survey_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: EventId,
    pub name: String,
    pub type_: String,
    pub origin: String,
    pub time: DateTime<Utc>,
}

/// Alert-DB collaborator (spec §6): `Event(name, type, origin, time)`,
/// `Notice(ivorn UNIQUE, survey_id, payload, ...)` with a back-reference to
/// Event.
#[async_trait]
pub trait AlertDb: Send + Sync {
    /// Look up an Event by `event_name`, creating it if this is the first
    /// notice seen for it (spec §3 `Event`, §4.6 step 2).
    async fn get_or_create_event(
        &self,
        name: &str,
        type_: &str,
        origin: &str,
        time: DateTime<Utc>,
    ) -> Result<StoredEvent, DbError>;

    /// Insert a Notice row keyed by IVORN. Fails [`DbError::DuplicateIvorn`]
    /// on a unique-key violation (spec §4.6 step 2, §7 `DuplicateNotice`).
    async fn insert_notice(
        &self,
        event_id: EventId,
        ivorn: &str,
        time: DateTime<Utc>,
        skymap_content_id: Option<u64>,
        strategy_key: Option<String>,
    ) -> Result<NoticeRowId, DbError>;

    async fn ivorn_exists(&self, ivorn: &str) -> Result<bool, DbError>;

    /// All notices recorded for an Event, oldest first (spec §3 `Event`
    /// "ordered lists of notices").
    async fn notices_for_event(&self, event_id: EventId) -> Result<Vec<StoredNotice>, DbError>;

    /// Back-reference a Notice row to the Survey it produced (spec §4.6
    /// step 6, "set the Notice's survey_id").
    async fn set_notice_survey(&self, row_id: NoticeRowId, survey_name: &str) -> Result<(), DbError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Scheduled,
    Unscheduled,
    Running,
    Completed,
    Expired,
    Deleted,
}

impl TargetStatus {
    /// `true` for the three terminal states (spec §3 `Target`).
    pub fn is_terminal(self) -> bool {
        matches!(self, TargetStatus::Completed | TargetStatus::Expired | TargetStatus::Deleted)
    }
}

#[derive(Debug, Clone)]
pub struct StoredTarget {
    pub id: TargetId,
    pub name: String,
    pub rank: i32,
    pub weight: f64,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub creation_time: DateTime<Utc>,
    pub running: bool,
    pub completed: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl StoredTarget {
    /// Status at a given instant (spec §3 `Target`): deletion and
    /// completion are sticky once set; otherwise derived from the window
    /// `[start_time, stop_time]`.
    pub fn status_at_time(&self, time: DateTime<Utc>) -> TargetStatus {
        if let Some(deleted_at) = self.deleted_at {
            if time >= deleted_at {
                return TargetStatus::Deleted;
            }
        }
        if self.completed {
            return TargetStatus::Completed;
        }
        if time > self.stop_time {
            return TargetStatus::Expired;
        }
        if time < self.start_time {
            return TargetStatus::Scheduled;
        }
        if self.running {
            return TargetStatus::Running;
        }
        TargetStatus::Unscheduled
    }
}

#[derive(Debug, Clone)]
pub struct GridTile {
    pub name: String,
    pub ra_deg: f64,
    pub dec_deg: f64,
}

/// A tile selected off the grid for a particular skymap, carrying the
/// probability mass the handler weights the Target by (spec §4.6 step 8).
#[derive(Debug, Clone)]
pub struct SelectedTile {
    pub tile: GridTile,
    pub prob: f64,
}

/// Fields for a new Target row, fully expanded by the handler before
/// insertion (spec §4.6 step 9).
#[derive(Debug, Clone)]
pub struct NewTarget {
    pub name: String,
    pub rank: i32,
    pub weight: f64,
    pub start_time: DateTime<Utc>,
    pub stop_time: DateTime<Utc>,
    pub creation_time: DateTime<Utc>,
    pub user_id: UserId,
    pub grid_tile: GridTile,
    pub exposure_sets: Vec<StrategyExposureSet>,
    pub strategies: Vec<NewStrategyRow>,
}

#[derive(Debug, Clone)]
pub struct NewStrategyRow {
    pub num_todo: u32,
    pub stop_time: DateTime<Utc>,
    pub wait_time: chrono::Duration,
    pub rank_change: i32,
    pub constraints: Constraints,
    pub too: bool,
}

/// Observation-DB collaborator (spec §6): `Survey`, `Target`, `ExposureSet`,
/// `Strategy`, `User`, `GridTile`, plus the helper operations the handler
/// and notifier call.
#[async_trait]
pub trait ObsDb: Send + Sync {
    async fn create_survey(&self, name: &str) -> Result<SurveyId, DbError>;
    async fn survey_count_for_event(&self, event_name: &str) -> Result<usize, DbError>;
    /// All Surveys ever created for an Event, in creation order (spec §8
    /// invariant 6, "no gaps").
    async fn surveys_for_event(&self, event_name: &str) -> Result<Vec<SurveyId>, DbError>;
    async fn latest_survey_for_event(&self, event_name: &str) -> Result<Option<SurveyId>, DbError>;
    async fn targets_for_survey(&self, survey_id: SurveyId) -> Result<Vec<StoredTarget>, DbError>;
    async fn mark_target_deleted(&self, target_id: TargetId, time: DateTime<Utc>) -> Result<(), DbError>;
    async fn create_target(&self, survey_id: SurveyId, target: NewTarget) -> Result<TargetId, DbError>;
    async fn get_or_create_user(&self, username: &str) -> Result<UserId, DbError>;
    async fn current_grid(&self) -> Result<Vec<GridTile>, DbError>;
}

// ---------------------------------------------------------------------
// In-memory reference implementation.
// ---------------------------------------------------------------------

#[derive(Default)]
struct AlertDbState {
    events_by_name: HashMap<String, EventId>,
    events: HashMap<EventId, StoredEvent>,
    notices_by_ivorn: HashMap<String, NoticeRowId>,
    notices: HashMap<NoticeRowId, StoredNotice>,
    notices_by_event: HashMap<EventId, Vec<NoticeRowId>>,
    next_event_id: EventId,
    next_notice_id: NoticeRowId,
}

/// Default alert-DB backing store: an in-process table good enough to run
/// the sentinel's tests and a single-process deployment against (spec §9,
/// "cyclic references -> arena-style identifiers").
#[derive(Default)]
pub struct InMemoryAlertDb {
    state: RwLock<AlertDbState>,
}

#[async_trait]
impl AlertDb for InMemoryAlertDb {
    async fn get_or_create_event(
        &self,
        name: &str,
        type_: &str,
        origin: &str,
        time: DateTime<Utc>,
    ) -> Result<StoredEvent, DbError> {
        let mut state = self.state.write().await;
        if let Some(&id) = state.events_by_name.get(name) {
            return Ok(state.events[&id].clone());
        }
        let id = state.next_event_id;
        state.next_event_id += 1;
        let event = StoredEvent {
            id,
            name: name.to_string(),
            type_: type_.to_string(),
            origin: origin.to_string(),
            time,
        };
        state.events_by_name.insert(name.to_string(), id);
        state.events.insert(id, event.clone());
        Ok(event)
    }

    async fn insert_notice(
        &self,
        event_id: EventId,
        ivorn: &str,
        time: DateTime<Utc>,
        skymap_content_id: Option<u64>,
        strategy_key: Option<String>,
    ) -> Result<NoticeRowId, DbError> {
        let mut state = self.state.write().await;
        if state.notices_by_ivorn.contains_key(ivorn) {
            return Err(DbError::DuplicateIvorn(ivorn.to_string()));
        }
        let row_id = state.next_notice_id;
        state.next_notice_id += 1;
        let row = StoredNotice {
            row_id,
            ivorn: ivorn.to_string(),
            time,
            skymap_content_id,
            strategy_key,
            survey_name: None,
        };
        state.notices_by_ivorn.insert(ivorn.to_string(), row_id);
        state.notices.insert(row_id, row);
        state.notices_by_event.entry(event_id).or_default().push(row_id);
        Ok(row_id)
    }

    async fn ivorn_exists(&self, ivorn: &str) -> Result<bool, DbError> {
        Ok(self.state.read().await.notices_by_ivorn.contains_key(ivorn))
    }

    async fn notices_for_event(&self, event_id: EventId) -> Result<Vec<StoredNotice>, DbError> {
        let state = self.state.read().await;
        Ok(state
            .notices_by_event
            .get(&event_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.notices.get(id).cloned())
            .collect())
    }

    async fn set_notice_survey(&self, row_id: NoticeRowId, survey_name: &str) -> Result<(), DbError> {
        let mut state = self.state.write().await;
        let row = state
            .notices
            .get_mut(&row_id)
            .ok_or(DbError::NoSuchEvent(row_id.to_string()))?;
        row.survey_name = Some(survey_name.to_string());
        Ok(())
    }
}

struct StoredSurvey {
    id: SurveyId,
    name: String,
    targets: Vec<TargetId>,
}

#[derive(Default)]
struct ObsDbState {
    surveys: HashMap<SurveyId, StoredSurvey>,
    surveys_by_event: HashMap<String, Vec<SurveyId>>,
    targets: HashMap<TargetId, StoredTarget>,
    users: HashMap<String, UserId>,
    grid: Vec<GridTile>,
    next_survey_id: SurveyId,
    next_target_id: TargetId,
    next_user_id: UserId,
}

/// Default observation-DB backing store (spec §9, same rationale as
/// [`InMemoryAlertDb`]). The grid defaults to a coarse all-sky Fibonacci
/// tessellation (see [`crate::grid`]) but can be overridden with
/// [`InMemoryObsDb::with_grid`].
pub struct InMemoryObsDb {
    state: RwLock<ObsDbState>,
}

impl Default for InMemoryObsDb {
    fn default() -> Self {
        Self::with_grid(crate::grid::default_grid())
    }
}

impl InMemoryObsDb {
    pub fn with_grid(grid: Vec<GridTile>) -> Self {
        Self {
            state: RwLock::new(ObsDbState {
                grid,
                ..ObsDbState::default()
            }),
        }
    }
}

#[async_trait]
impl ObsDb for InMemoryObsDb {
    async fn create_survey(&self, name: &str) -> Result<SurveyId, DbError> {
        let mut state = self.state.write().await;
        let id = state.next_survey_id;
        state.next_survey_id += 1;
        state.surveys.insert(
            id,
            StoredSurvey {
                id,
                name: name.to_string(),
                targets: Vec::new(),
            },
        );
        // `{event_name}_{n}` -> event_name is everything before the final `_n`.
        if let Some(event_name) = name.rsplit_once('_').map(|(prefix, _)| prefix.to_string()) {
            state.surveys_by_event.entry(event_name).or_default().push(id);
        }
        Ok(id)
    }

    async fn survey_count_for_event(&self, event_name: &str) -> Result<usize, DbError> {
        let state = self.state.read().await;
        Ok(state
            .surveys_by_event
            .get(event_name)
            .map(Vec::len)
            .unwrap_or(0))
    }

    async fn surveys_for_event(&self, event_name: &str) -> Result<Vec<SurveyId>, DbError> {
        let state = self.state.read().await;
        Ok(state.surveys_by_event.get(event_name).cloned().unwrap_or_default())
    }

    async fn latest_survey_for_event(&self, event_name: &str) -> Result<Option<SurveyId>, DbError> {
        let state = self.state.read().await;
        Ok(state
            .surveys_by_event
            .get(event_name)
            .and_then(|ids| ids.last().copied()))
    }

    async fn targets_for_survey(&self, survey_id: SurveyId) -> Result<Vec<StoredTarget>, DbError> {
        let state = self.state.read().await;
        let survey = state
            .surveys
            .get(&survey_id)
            .ok_or_else(|| DbError::NoSuchSurvey(survey_id.to_string()))?;
        Ok(survey
            .targets
            .iter()
            .filter_map(|id| state.targets.get(id).cloned())
            .collect())
    }

    async fn mark_target_deleted(&self, target_id: TargetId, time: DateTime<Utc>) -> Result<(), DbError> {
        let mut state = self.state.write().await;
        let target = state
            .targets
            .get_mut(&target_id)
            .ok_or(DbError::NoSuchTarget(target_id))?;
        target.deleted_at = Some(time);
        Ok(())
    }

    async fn create_target(&self, survey_id: SurveyId, target: NewTarget) -> Result<TargetId, DbError> {
        let mut state = self.state.write().await;
        if !state.surveys.contains_key(&survey_id) {
            return Err(DbError::NoSuchSurvey(survey_id.to_string()));
        }
        let id = state.next_target_id;
        state.next_target_id += 1;
        state.targets.insert(
            id,
            StoredTarget {
                id,
                name: target.name,
                rank: target.rank,
                weight: target.weight,
                start_time: target.start_time,
                stop_time: target.stop_time,
                creation_time: target.creation_time,
                running: false,
                completed: false,
                deleted_at: None,
            },
        );
        state.surveys.get_mut(&survey_id).expect("checked above").targets.push(id);
        Ok(id)
    }

    async fn get_or_create_user(&self, username: &str) -> Result<UserId, DbError> {
        let mut state = self.state.write().await;
        if let Some(&id) = state.users.get(username) {
            return Ok(id);
        }
        let id = state.next_user_id;
        state.next_user_id += 1;
        state.users.insert(username.to_string(), id);
        Ok(id)
    }

    async fn current_grid(&self) -> Result<Vec<GridTile>, DbError> {
        Ok(self.state.read().await.grid.clone())
    }
}

/// Shared references to both databases, threaded through the handler and
/// dispatcher (spec §9 "explicit context").
#[derive(Clone)]
pub struct Databases {
    pub alert: Arc<dyn AlertDb>,
    pub obs: Arc<dyn ObsDb>,
}

impl Databases {
    pub fn in_memory() -> Self {
        Self {
            alert: Arc::new(InMemoryAlertDb::default()),
            obs: Arc::new(InMemoryObsDb::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_ivorn_rejected() {
        let db = InMemoryAlertDb::default();
        let event = db
            .get_or_create_event("LVC_S1", "GW", "LVC", Utc::now())
            .await
            .unwrap();
        db.insert_notice(event.id, "ivo://x#1", Utc::now(), None, None)
            .await
            .unwrap();
        let err = db
            .insert_notice(event.id, "ivo://x#1", Utc::now(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateIvorn(_)));
    }

    #[tokio::test]
    async fn get_or_create_event_is_idempotent() {
        let db = InMemoryAlertDb::default();
        let a = db.get_or_create_event("LVC_S1", "GW", "LVC", Utc::now()).await.unwrap();
        let b = db.get_or_create_event("LVC_S1", "GW", "LVC", Utc::now()).await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn target_status_transitions() {
        let now = Utc::now();
        let target = StoredTarget {
            id: 1,
            name: "t".to_string(),
            rank: 1,
            weight: 0.5,
            start_time: now,
            stop_time: now + chrono::Duration::hours(1),
            creation_time: now,
            running: false,
            completed: false,
            deleted_at: None,
        };
        assert_eq!(target.status_at_time(now - chrono::Duration::minutes(1)), TargetStatus::Scheduled);
        assert_eq!(target.status_at_time(now + chrono::Duration::minutes(30)), TargetStatus::Unscheduled);
        assert_eq!(target.status_at_time(now + chrono::Duration::hours(2)), TargetStatus::Expired);

        let mut deleted = target.clone();
        deleted.deleted_at = Some(now + chrono::Duration::minutes(10));
        assert_eq!(deleted.status_at_time(now + chrono::Duration::minutes(20)), TargetStatus::Deleted);
        assert!(deleted.status_at_time(now + chrono::Duration::minutes(20)).is_terminal());
    }
}
