//! Task identity and request/response records

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::quantity::Quantity;
use super::EXPOSURE_SUFFIX;

/// DNS label limit of the platform (RFC 1123)
pub const MAX_LABEL_LENGTH: usize = 63;

/// Longest TaskID whose exposure-unit name still fits a DNS label
pub const MAX_TASK_ID_LENGTH: usize = MAX_LABEL_LENGTH - EXPOSURE_SUFFIX.len();

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidName {
    #[error("task name is empty")]
    Empty,

    #[error("task name '{name}' is longer than {max} characters once normalized")]
    TooLong { name: String, max: usize },

    #[error("task name '{0}' may only contain letters, digits, spaces and '-'")]
    InvalidCharacters(String),

    #[error("task name '{0}' must start and end with a letter or digit")]
    InvalidBoundary(String),
}

/// Normalize a free-text task name towards a DNS label: trim, lowercase, and
/// collapse whitespace runs into a single `-`. Idempotent.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(|part| part.to_lowercase())
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonical, cluster-unique task identifier.
///
/// Doubles as the workload-unit name, the `app` label value selecting it and
/// the exposure-unit name prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Normalize a user-supplied name and validate it against platform naming rules
    pub fn parse(name: &str) -> Result<Self, InvalidName> {
        let normalized = normalize_name(name);

        if normalized.is_empty() {
            return Err(InvalidName::Empty);
        }
        if normalized.len() > MAX_TASK_ID_LENGTH {
            return Err(InvalidName::TooLong {
                name: normalized,
                max: MAX_TASK_ID_LENGTH,
            });
        }
        if !normalized
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(InvalidName::InvalidCharacters(normalized));
        }
        let alnum = |c: Option<char>| c.map(|c| c.is_ascii_alphanumeric()).unwrap_or(false);
        if !alnum(normalized.chars().next()) || !alnum(normalized.chars().last()) {
            return Err(InvalidName::InvalidBoundary(normalized));
        }

        Ok(Self(normalized))
    }

    /// Recover a TaskID from an exposure-unit name (`<id>-service`)
    pub fn from_exposure_name(name: &str) -> Result<Self, InvalidName> {
        Self::parse(name.strip_suffix(EXPOSURE_SUFFIX).unwrap_or(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the exposure unit fronting this task
    pub fn exposure_name(&self) -> String {
        format!("{}{}", self.0, EXPOSURE_SUFFIX)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A request to run a named compute task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Free-text name, normalized into the TaskID
    #[serde(rename = "taskName")]
    pub name: String,

    #[serde(rename = "cpus")]
    pub cpu_request: Quantity,

    #[serde(rename = "gpus")]
    pub gpu_request: Quantity,

    #[serde(rename = "imageName")]
    pub image: String,
}

impl TaskSpec {
    pub fn new(
        name: impl Into<String>,
        cpu_request: Quantity,
        gpu_request: Quantity,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cpu_request,
            gpu_request,
            image: image.into(),
        }
    }
}

/// Outcome of a fully successful create
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedTask {
    #[serde(rename = "podName")]
    pub task_id: TaskId,

    #[serde(rename = "nodePort")]
    pub node_port: u16,

    #[serde(rename = "serviceURL")]
    pub service_url: String,
}

/// Phases of the delete-then-recreate resize transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizePhase {
    /// Resources updated in memory, old unit still present
    Resizing,
    /// Old unit deletion requested, waiting for the platform to confirm
    WaitingForDeletion,
    /// Old unit gone, replacement being submitted
    Recreating,
}

impl fmt::Display for ResizePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            ResizePhase::Resizing => "Resizing",
            ResizePhase::WaitingForDeletion => "WaitingForDeletion",
            ResizePhase::Recreating => "Recreating",
        };
        f.write_str(phase)
    }
}

/// An in-flight or stalled resize, as seen by List
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingResize {
    pub phase: ResizePhase,

    #[serde(rename = "targetCpus")]
    pub target_cpu: Quantity,

    #[serde(rename = "targetGpus")]
    pub target_gpu: Quantity,

    #[serde(rename = "startedAt")]
    pub started_at: chrono::DateTime<chrono::Utc>,
}

/// Detailed listing row for one task
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub name: String,

    #[serde(rename = "imageName")]
    pub image: String,

    pub cpus: Quantity,

    pub gpus: Quantity,

    /// `None` when the exposure unit is missing (partial create)
    #[serde(rename = "nodePort")]
    pub node_port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    #[serde(rename = "pendingResize")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_resize: Option<PendingResize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_lowercases_and_hyphenates() {
        assert_eq!(normalize_name("My Task"), "my-task");
        assert_eq!(normalize_name("  GPU   Train\tJob "), "gpu-train-job");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for name in ["My Task", "already-fine", "  Mixed CASE  name ", "", "a b-c D"] {
            let once = normalize_name(name);
            assert_eq!(normalize_name(&once), once);
            assert!(!once.contains(' '));
            assert_eq!(once, once.to_lowercase());
        }
    }

    #[test]
    fn test_parse_valid_name() {
        let id = TaskId::parse("My Task").unwrap();
        assert_eq!(id.as_str(), "my-task");
        assert_eq!(id.exposure_name(), "my-task-service");
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert_eq!(TaskId::parse("   "), Err(InvalidName::Empty));
    }

    #[test]
    fn test_parse_rejects_too_long() {
        let name = "a".repeat(MAX_TASK_ID_LENGTH + 1);
        assert!(matches!(
            TaskId::parse(&name),
            Err(InvalidName::TooLong { .. })
        ));
        assert!(TaskId::parse(&"a".repeat(MAX_TASK_ID_LENGTH)).is_ok());
    }

    #[test]
    fn test_parse_rejects_bad_characters() {
        assert!(matches!(
            TaskId::parse("my_task!"),
            Err(InvalidName::InvalidCharacters(_))
        ));
        assert!(matches!(
            TaskId::parse("-leading"),
            Err(InvalidName::InvalidBoundary(_))
        ));
    }

    #[test]
    fn test_from_exposure_name() {
        let id = TaskId::from_exposure_name("my-task-service").unwrap();
        assert_eq!(id.as_str(), "my-task");
    }

    #[test]
    fn test_task_spec_deserializes_request_shape() {
        let json = r#"{"taskName": "My Task", "cpus": "2", "gpus": 1, "imageName": "jupyter/base"}"#;
        let spec: TaskSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.cpu_request, Quantity::from_units(2));
        assert_eq!(spec.gpu_request, Quantity::from_units(1));
        assert_eq!(spec.image, "jupyter/base");
    }
}
