//! Task templates - per-image defaults for restart policy, command and storage

use serde::{Deserialize, Serialize};

use crate::cluster::gateway::{RestartPolicy, VolumeMount};

/// Persistent storage attached to tasks created from a template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeTemplate {
    /// Existing persistent volume claim to mount
    pub claim_name: String,
    /// Mount path inside the container
    pub mount_path: String,
}

/// Defaults applied to tasks whose image starts with `image_prefix`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplate {
    pub name: String,

    /// Image prefix this template applies to (e.g. "jupyter/")
    #[serde(default)]
    pub image_prefix: String,

    #[serde(default)]
    pub restart_policy: RestartPolicy,

    /// Startup command overriding the image entrypoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeTemplate>,
}

impl Default for TaskTemplate {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            image_prefix: String::new(),
            restart_policy: RestartPolicy::Always,
            command: None,
            volume: None,
        }
    }
}

impl TaskTemplate {
    pub fn matches(&self, image: &str) -> bool {
        image.starts_with(&self.image_prefix)
    }

    /// Volume mount for a task, named after the task
    pub fn volume_mount(&self, task_id: &str) -> Option<VolumeMount> {
        self.volume.as_ref().map(|v| VolumeMount {
            name: format!("{}-data", task_id),
            claim_name: v.claim_name.clone(),
            mount_path: v.mount_path.clone(),
        })
    }
}

/// First template matching the image, else the built-in default
pub fn select_template(templates: &[TaskTemplate], image: &str) -> TaskTemplate {
    templates
        .iter()
        .find(|t| t.matches(image))
        .cloned()
        .unwrap_or_default()
}
