//! Route journal for crash recovery
//!
//! The orchestrator records every route it believes is installed. After an
//! unclean exit the next run loads the journal and treats those routes as
//! active, so they get cleaned up or reconciled instead of leaking.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::vpn::route::ActiveRoute;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to access state file: {0}")]
    IoError(#[from] io::Error),
    #[error("Failed to parse state file: {0}")]
    ParseError(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub saved_at: Option<DateTime<Utc>>,
    pub routes: Vec<ActiveRoute>,
    pub hosts_written: bool,
}

pub struct RouteJournal {
    path: PathBuf,
}

impl RouteJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/vpn-bypass/state.json`
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vpn-bypass")
            .join("state.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the journal. A missing file yields `None`; a corrupt one is
    /// reported so the caller can decide whether to discard it.
    pub fn load(&self) -> Result<Option<JournalRecord>, StateError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record = serde_json::from_str(&content)?;
        Ok(Some(record))
    }

    pub fn save(&self, routes: &[ActiveRoute], hosts_written: bool) -> Result<(), StateError> {
        if routes.is_empty() && !hosts_written {
            return self.clear();
        }
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let record = JournalRecord {
            saved_at: Some(Utc::now()),
            routes: routes.to_vec(),
            hosts_written,
        };
        let json = serde_json::to_string_pretty(&record)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!("Saved {} routes to {}", routes.len(), self.path.display());
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StateError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("Failed to remove {}: {}", self.path.display(), e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpn::route::{RouteOrigin, RouteSource, RouteTarget};

    fn route() -> ActiveRoute {
        ActiveRoute::new(
            RouteTarget::network("91.108.4.0/22".parse().unwrap()),
            "192.168.1.1".parse().unwrap(),
            RouteOrigin::new(RouteSource::Service, "telegram"),
        )
    }

    #[test]
    fn test_missing_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RouteJournal::new(dir.path().join("state.json"));
        assert!(journal.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RouteJournal::new(dir.path().join("nested").join("state.json"));

        let saved = route();
        journal.save(&[saved.clone()], true).unwrap();
        let record = journal.load().unwrap().unwrap();
        assert_eq!(record.routes, vec![saved]);
        assert!(record.hosts_written);
        assert!(record.saved_at.is_some());
    }

    #[test]
    fn test_empty_save_clears() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RouteJournal::new(dir.path().join("state.json"));

        journal.save(&[route()], false).unwrap();
        assert!(journal.path().exists());
        journal.save(&[], false).unwrap();
        assert!(!journal.path().exists());
    }

    #[test]
    fn test_save_replaces_without_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let journal = RouteJournal::new(dir.path().join("state.json"));

        journal.save(&[route()], false).unwrap();
        journal.save(&[], true).unwrap();

        let record = journal.load().unwrap().unwrap();
        assert!(record.routes.is_empty());
        assert!(record.hosts_written);
        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_corrupt_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let journal = RouteJournal::new(path);
        assert!(matches!(journal.load(), Err(StateError::ParseError(_))));
    }
}
