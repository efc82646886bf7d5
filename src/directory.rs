//! Provider directory: where session-open snapshots of [`ProviderProfile`]s come from.
//!
//! The directory is owned by the rating/history collaborator. The engine only reads it
//! once per session; when it is unreachable the session manager falls back to the last
//! snapshot it saw and flags the session as running on stale data.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::error::EngineError;
use crate::types::{ProviderId, ProviderProfile, Request};

pub trait ProviderDirectory: Send + Sync {
    /// Profiles relevant to `request`. Implementations may return the whole pool; the
    /// eligibility filter narrows it down.
    fn snapshot(&self, request: &Request) -> Result<Vec<ProviderProfile>, EngineError>;
}

/// Directory held in memory, with a switch to simulate an outage.
#[derive(Debug)]
pub struct InMemoryDirectory {
    profiles: RwLock<BTreeMap<ProviderId, ProviderProfile>>,
    available: AtomicBool,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self {
            profiles: RwLock::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryDirectory {
    pub fn new(profiles: impl IntoIterator<Item = ProviderProfile>) -> Self {
        let directory = Self::default();
        for p in profiles {
            directory.upsert(p);
        }
        directory
    }

    /// Inserts or replaces a profile. Sessions already open keep their snapshot.
    pub fn upsert(&self, profile: ProviderProfile) {
        self.profiles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(profile.provider_id, profile);
    }

    pub fn remove(&self, provider: ProviderId) -> Option<ProviderProfile> {
        self.profiles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&provider)
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl ProviderDirectory for InMemoryDirectory {
    fn snapshot(&self, _request: &Request) -> Result<Vec<ProviderProfile>, EngineError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(EngineError::CollaboratorUnavailable("provider directory offline".into()));
        }
        Ok(self
            .profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }
}
