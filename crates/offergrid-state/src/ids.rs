//! Structured identifiers for taskgroups and tasks.
//!
//! The textual forms are only used at the storage and cluster-manager
//! boundary:
//!
//! ```text
//! taskgroup: {index}.{app_id}.{run_as}.{cluster_id}.{created_nanos}
//! task:      {task_index}.{taskgroup}
//! ```
//!
//! None of the string components may contain a `.`; constructors reject
//! them so that parsing always recovers the original fields.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{StateError, StateResult};

/// Identity of one taskgroup (pod) of an application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskGroupId {
    /// Logical slot of the taskgroup inside its application.
    pub index: u32,
    pub app_id: String,
    pub run_as: String,
    pub cluster_id: String,
    /// Creation time in unix nanoseconds.
    pub created: u64,
}

impl TaskGroupId {
    pub fn new(
        index: u32,
        app_id: &str,
        run_as: &str,
        cluster_id: &str,
        created: u64,
    ) -> StateResult<Self> {
        for (field, value) in [("app_id", app_id), ("run_as", run_as), ("cluster_id", cluster_id)] {
            check_component(field, value)?;
        }
        Ok(Self {
            index,
            app_id: app_id.to_string(),
            run_as: run_as.to_string(),
            cluster_id: cluster_id.to_string(),
            created,
        })
    }

    /// Id of the `task_index`-th task inside this taskgroup.
    pub fn task_id(&self, task_index: u32) -> TaskId {
        TaskId {
            index: task_index,
            group: self.clone(),
        }
    }
}

impl fmt::Display for TaskGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.index, self.app_id, self.run_as, self.cluster_id, self.created
        )
    }
}

impl FromStr for TaskGroupId {
    type Err = StateError;

    fn from_str(s: &str) -> StateResult<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 5 {
            return Err(malformed(s, "expected 5 dot-separated fields"));
        }
        let index = parts[0]
            .parse::<u32>()
            .map_err(|e| malformed(s, &format!("index: {e}")))?;
        let created = parts[4]
            .parse::<u64>()
            .map_err(|e| malformed(s, &format!("timestamp: {e}")))?;
        if parts[1..4].iter().any(|p| p.is_empty()) {
            return Err(malformed(s, "empty field"));
        }
        Ok(Self {
            index,
            app_id: parts[1].to_string(),
            run_as: parts[2].to_string(),
            cluster_id: parts[3].to_string(),
            created,
        })
    }
}

impl Ord for TaskGroupId {
    /// Creation order first, then slot index.
    fn cmp(&self, other: &Self) -> Ordering {
        self.created
            .cmp(&other.created)
            .then(self.index.cmp(&other.index))
            .then_with(|| self.run_as.cmp(&other.run_as))
            .then_with(|| self.app_id.cmp(&other.app_id))
            .then_with(|| self.cluster_id.cmp(&other.cluster_id))
    }
}

impl PartialOrd for TaskGroupId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Identity of one task inside a taskgroup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub index: u32,
    pub group: TaskGroupId,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.group)
    }
}

impl FromStr for TaskId {
    type Err = StateError;

    fn from_str(s: &str) -> StateResult<Self> {
        let (index, rest) = s
            .split_once('.')
            .ok_or_else(|| malformed(s, "missing task index"))?;
        let index = index
            .parse::<u32>()
            .map_err(|e| malformed(s, &format!("task index: {e}")))?;
        Ok(Self {
            index,
            group: rest.parse()?,
        })
    }
}

macro_rules! string_serde {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(TaskGroupId);
string_serde!(TaskId);

/// Recover `(run_as, app_id)` from a textual taskgroup id.
pub fn run_as_and_app_id(taskgroup_id: &str) -> StateResult<(String, String)> {
    let id: TaskGroupId = taskgroup_id.parse()?;
    Ok((id.run_as, id.app_id))
}

/// Recover the owning taskgroup id from a textual task id.
pub fn taskgroup_id_of_task(task_id: &str) -> StateResult<TaskGroupId> {
    Ok(task_id.parse::<TaskId>()?.group)
}

/// Reject names that would break the dotted encoding.
pub fn check_component(field: &str, value: &str) -> StateResult<()> {
    if value.is_empty() {
        return Err(StateError::MalformedId {
            id: value.to_string(),
            reason: format!("{field} is empty"),
        });
    }
    if value.contains('.') || value.contains('/') {
        return Err(StateError::MalformedId {
            id: value.to_string(),
            reason: format!("{field} must not contain '.' or '/'"),
        });
    }
    Ok(())
}

fn malformed(id: &str, reason: &str) -> StateError {
    StateError::MalformedId {
        id: id.to_string(),
        reason: reason.to_string(),
    }
}
