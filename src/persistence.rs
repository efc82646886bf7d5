//! Session archive: durable records of terminal sessions.
//!
//! A [`SessionRecord`] carries the request, the append-only bid log and the transition
//! log, which is enough to replay an auction for audit or dispute resolution. Records are
//! rewritten when a matched session is later superseded.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::EngineError;
use crate::session::SessionRecord;
use crate::types::SessionId;

pub trait SessionArchive: Send + Sync {
    /// Stores (or overwrites) the record for `record.session_id`.
    fn store(&self, record: &SessionRecord) -> Result<(), EngineError>;
    fn load(&self, session_id: SessionId) -> Result<Option<SessionRecord>, EngineError>;
}

/// Archive kept in process memory. Default for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryArchive {
    records: Mutex<HashMap<SessionId, SessionRecord>>,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionArchive for InMemoryArchive {
    fn store(&self, record: &SessionRecord) -> Result<(), EngineError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.session_id, record.clone());
        Ok(())
    }

    fn load(&self, session_id: SessionId) -> Result<Option<SessionRecord>, EngineError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .cloned())
    }
}

/// One pretty-printed JSON file per session under a directory.
#[derive(Clone, Debug)]
pub struct FileArchive {
    dir: PathBuf,
}

impl FileArchive {
    /// Uses `dir`, creating it if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| EngineError::Archive(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, session_id: SessionId) -> PathBuf {
        self.dir.join(format!("session-{}.json", session_id.0))
    }
}

impl SessionArchive for FileArchive {
    fn store(&self, record: &SessionRecord) -> Result<(), EngineError> {
        let json = serde_json::to_string_pretty(record).map_err(|e| EngineError::Archive(e.to_string()))?;
        let path = self.path_for(record.session_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| EngineError::Archive(e.to_string()))?;
        std::fs::rename(&tmp, &path).map_err(|e| EngineError::Archive(e.to_string()))
    }

    /// Returns `None` if no record exists for the session.
    fn load(&self, session_id: SessionId) -> Result<Option<SessionRecord>, EngineError> {
        let data = match std::fs::read_to_string(self.path_for(session_id)) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EngineError::Archive(e.to_string())),
        };
        let record = serde_json::from_str(&data).map_err(|e| EngineError::Archive(e.to_string()))?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::geo::{Location, ServiceArea};
    use crate::session::BidSession;
    use crate::types::{PriorityTier, ProviderId, ProviderProfile, Request, RequestId, RequesterId, SelectionMode};
    use rust_decimal::Decimal;
    use std::collections::{BTreeMap, BTreeSet};

    fn cancelled_record() -> SessionRecord {
        let request = Request {
            request_id: RequestId("r-archive".into()),
            requester_id: RequesterId(1),
            origin: Location { lat: 0.5, lon: 0.5 },
            destination: Location { lat: 0.6, lon: 0.6 },
            required_tags: BTreeSet::new(),
            size: Decimal::from(1),
            earliest_start: 0,
            latest_delivery: 10_000_000,
            declared_value: Decimal::ZERO,
            priority: PriorityTier::Standard,
            selection: SelectionMode::Auto,
            supersedes: None,
            excluded_providers: BTreeSet::new(),
        };
        let provider = ProviderProfile {
            provider_id: ProviderId(1),
            tags: BTreeSet::new(),
            capacity: Decimal::from(5),
            service_area: ServiceArea::rect(0.0, 0.0, 1.0, 1.0),
            in_flight_jobs: 0,
            max_concurrent_jobs: 1,
            on_time_rate: 1.0,
            cancellation_rate: 0.0,
            completed_jobs: 0,
            equipment_score: 1.0,
            completed_by_tag: BTreeMap::new(),
            requester_flags: BTreeMap::new(),
        };
        let mut session = BidSession::open(SessionId(42), request, vec![provider], false, EngineConfig::default(), 0);
        session.cancel("test", 1).unwrap();
        session.to_record()
    }

    #[test]
    fn in_memory_round_trip() {
        let archive = InMemoryArchive::new();
        assert!(archive.is_empty());
        let record = cancelled_record();
        archive.store(&record).unwrap();
        assert_eq!(archive.load(SessionId(42)).unwrap(), Some(record));
        assert_eq!(archive.load(SessionId(1)).unwrap(), None);
    }

    #[test]
    fn file_archive_persists_transition_log() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FileArchive::new(dir.path()).unwrap();
        let record = cancelled_record();
        archive.store(&record).unwrap();
        let loaded = archive.load(SessionId(42)).unwrap().unwrap();
        assert_eq!(loaded.transitions.len(), record.transitions.len());
        assert_eq!(loaded.outcome, record.outcome);
        assert!(archive.load(SessionId(7)).unwrap().is_none());
    }
}
