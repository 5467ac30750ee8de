//! Persisted session record.
//!
//! The record says "authentication was verified at T and is good for TTL".
//! It lives on disk so independent short-lived invocations share it, is
//! written owner-only via temp file + rename, and reads fail safe: any I/O
//! or parse problem means "not fresh".
//!
//! An explicit lock deletes the record and writes a lock marker. Unlock
//! waits compare markers to notice a lock that happened while they polled.

use crate::fsutil;
use chrono::{DateTime, Utc};
use kg_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub verified_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl SessionRecord {
    /// Time left at `now` under an effective `ttl`. `None` once expired, or
    /// if `verified_at` lies in the future.
    pub fn remaining_at(&self, now: DateTime<Utc>, ttl: Duration) -> Option<Duration> {
        let elapsed = now.signed_duration_since(self.verified_at).to_std().ok()?;
        ttl.checked_sub(elapsed).filter(|left| !left.is_zero())
    }
}

/// Written by every explicit lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    pub id: String,
    pub locked_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    marker_path: PathBuf,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>, marker_path: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            path: path.into(),
            marker_path: marker_path.into(),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Read the record. Missing is `Ok(None)`; anything unreadable is an
    /// error the caller may treat as expired.
    pub fn load(&self) -> Result<Option<SessionRecord>> {
        fsutil::read_json(&self.path).map_err(|e| Error::SessionStoreIo {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn effective_ttl(&self, record: &SessionRecord) -> Duration {
        self.ttl.min(Duration::from_secs(record.ttl_secs))
    }

    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }

    /// `now - verified_at < ttl`, using the shorter of the stored and the
    /// configured TTL.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.remaining_at(now).is_some()
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.remaining_at(Utc::now())
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self.load() {
            Ok(Some(record)) => record.remaining_at(now, self.effective_ttl(&record)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "session record unreadable, treating as expired");
                None
            }
        }
    }

    pub fn touch(&self) -> Result<SessionRecord> {
        self.touch_at(Utc::now())
    }

    /// Record a successful verification at `now`. Last writer wins.
    pub fn touch_at(&self, now: DateTime<Utc>) -> Result<SessionRecord> {
        let record = SessionRecord {
            verified_at: now,
            ttl_secs: self.ttl.as_secs(),
        };
        fsutil::write_json_atomic(&self.path, &record).map_err(|e| Error::SessionStoreIo {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        Ok(record)
    }

    /// Delete the record and leave a fresh lock marker. Idempotent.
    pub fn invalidate(&self) -> Result<LockMarker> {
        fsutil::remove_if_exists(&self.path).map_err(|e| Error::SessionStoreIo {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let marker = LockMarker {
            id: uuid::Uuid::new_v4().to_string(),
            locked_at: Utc::now(),
        };
        fsutil::write_json_atomic(&self.marker_path, &marker).map_err(|e| {
            Error::SessionStoreIo {
                path: self.marker_path.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(marker)
    }

    /// Whether an explicit lock is newer than the last verification. Until
    /// the next `touch`, nothing may serve keys on its own initiative.
    pub fn is_locked(&self) -> bool {
        let Some(marker) = self.lock_marker() else {
            return false;
        };
        match self.load() {
            Ok(Some(record)) => record.verified_at < marker.locked_at,
            _ => true,
        }
    }

    /// The most recent lock marker, if any.
    pub fn lock_marker(&self) -> Option<LockMarker> {
        match fsutil::read_json(&self.marker_path) {
            Ok(marker) => marker,
            Err(e) => {
                warn!(error = %e, path = %self.marker_path.display(), "lock marker unreadable");
                None
            }
        }
    }
}
