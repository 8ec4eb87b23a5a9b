//! Process identity and the OS "processes in error state" query.
//!
//! The confirmation loop asks an [`ErrorStateQuery`] which processes the
//! environment currently considers crashed or not responding. Only an entry
//! for *this* pid in the [`ErrorCondition::NotResponding`] condition counts
//! as confirmation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::IntrospectionError;

/// Who "this process" is, for matching error-state entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    /// Owning user, when the platform exposes it.
    pub uid: Option<u32>,
}

impl ProcessIdentity {
    #[must_use]
    pub fn new(pid: u32, uid: Option<u32>) -> Self {
        Self { pid, uid }
    }

    /// Identity of the running process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            uid: current_uid(),
        }
    }
}

#[cfg(target_os = "linux")]
fn current_uid() -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    std::fs::metadata("/proc/self").ok().map(|m| m.uid())
}

#[cfg(not(target_os = "linux"))]
fn current_uid() -> Option<u32> {
    None
}

/// Why the environment flagged a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCondition {
    Crashed,
    NotResponding,
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crashed => write!(f, "crashed"),
            Self::NotResponding => write!(f, "not_responding"),
        }
    }
}

/// One entry of the environment's error-state list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessErrorState {
    pub pid: u32,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub process_name: String,
    pub condition: ErrorCondition,
}

impl ProcessErrorState {
    #[must_use]
    pub fn not_responding(pid: u32, uid: Option<u32>, process_name: impl Into<String>) -> Self {
        Self {
            pid,
            uid,
            process_name: process_name.into(),
            condition: ErrorCondition::NotResponding,
        }
    }

    /// True when this entry confirms a hang of `identity`.
    #[must_use]
    pub fn confirms(&self, identity: &ProcessIdentity) -> bool {
        self.pid == identity.pid && self.condition == ErrorCondition::NotResponding
    }

    /// True when another user's process is reported as not responding.
    #[must_use]
    pub fn is_foreign_hang(&self, identity: &ProcessIdentity) -> bool {
        let foreign = match (self.uid, identity.uid) {
            (Some(theirs), Some(ours)) => theirs != ours,
            _ => self.pid != identity.pid,
        };
        foreign && self.condition == ErrorCondition::NotResponding
    }
}

/// Source of the environment's error-state list.
pub trait ErrorStateQuery: Send + Sync {
    /// Processes currently in an error state. Empty when none.
    fn processes_in_error_state(&self) -> Result<Vec<ProcessErrorState>, IntrospectionError>;
}

/// Reads the error-state list from a JSON file maintained by a supervisor.
///
/// A missing file means no process is in an error state.
#[derive(Debug, Clone)]
pub struct FileErrorStateQuery {
    path: PathBuf,
}

impl FileErrorStateQuery {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ErrorStateQuery for FileErrorStateQuery {
    fn processes_in_error_state(&self) -> Result<Vec<ProcessErrorState>, IntrospectionError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Err(IntrospectionError::PermissionDenied(format!(
                    "{}: {e}",
                    self.path.display()
                )));
            }
            Err(e) => {
                return Err(IntrospectionError::QueryFailed(format!(
                    "{}: {e}",
                    self.path.display()
                )));
            }
        };

        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }

        serde_json::from_str(&raw).map_err(|e| IntrospectionError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn me() -> ProcessIdentity {
        ProcessIdentity::new(100, Some(1000))
    }

    #[test]
    fn current_identity_uses_own_pid() {
        assert_eq!(ProcessIdentity::current().pid, std::process::id());
    }

    #[test]
    fn only_own_not_responding_entry_confirms() {
        let ours = ProcessErrorState::not_responding(100, Some(1000), "app");
        assert!(ours.confirms(&me()));

        let crashed = ProcessErrorState {
            condition: ErrorCondition::Crashed,
            ..ours.clone()
        };
        assert!(!crashed.confirms(&me()));

        let other = ProcessErrorState::not_responding(200, Some(1000), "sibling");
        assert!(!other.confirms(&me()));
    }

    #[test]
    fn foreign_hang_detection() {
        let foreign = ProcessErrorState::not_responding(300, Some(2000), "other-app");
        assert!(foreign.is_foreign_hang(&me()));

        let same_user = ProcessErrorState::not_responding(300, Some(1000), "helper");
        assert!(!same_user.is_foreign_hang(&me()));

        let unknown_uid = ProcessErrorState::not_responding(300, None, "unknown");
        assert!(unknown_uid.is_foreign_hang(&me()));
    }

    #[test]
    fn file_query_missing_file_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let query = FileErrorStateQuery::new(tmp.path().join("absent.json"));
        assert!(query.processes_in_error_state().unwrap().is_empty());
    }

    #[test]
    fn file_query_parses_entries() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("errors.json");
        std::fs::write(
            &path,
            r#"[{"pid": 42, "uid": 7, "process_name": "app", "condition": "not_responding"},
                {"pid": 43, "condition": "crashed"}]"#,
        )
        .unwrap();
        let entries = FileErrorStateQuery::new(&path)
            .processes_in_error_state()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].condition, ErrorCondition::NotResponding);
        assert_eq!(entries[1].uid, None);
        assert!(entries[1].process_name.is_empty());
    }

    #[test]
    fn file_query_empty_file_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("errors.json");
        std::fs::write(&path, "  \n").unwrap();
        assert!(FileErrorStateQuery::new(&path)
            .processes_in_error_state()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn file_query_garbage_is_malformed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("errors.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = FileErrorStateQuery::new(&path)
            .processes_in_error_state()
            .unwrap_err();
        assert!(matches!(err, IntrospectionError::Malformed(_)));
    }

    #[test]
    fn condition_display() {
        assert_eq!(ErrorCondition::NotResponding.to_string(), "not_responding");
        assert_eq!(ErrorCondition::Crashed.to_string(), "crashed");
    }
}
