//! Action Groups
//!
//! The compiled program the runner interprets: one group of actions per
//! container, produced by the workflow compiler.
//!
//! # Example (YAML)
//!
//! ```yaml
//! - - type: setup
//!     copy_binaries: true
//!     target_dir: /.shared/bin
//!   - type: declare
//!     ref: root
//!     condition: "true"
//!   - type: container
//!     ref: root
//!     config:
//!       command: ["/bin/sh", "-c"]
//!       args: ["echo hello"]
//!   - type: start
//!     ref: root
//!   - type: execute
//!     ref: root
//!   - type: end
//!     ref: root
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("failed to read action groups from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid action groups in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Environment a step's command runs in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Program and leading arguments
    #[serde(default)]
    pub command: Vec<String>,
    /// Arguments appended after `command`
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

impl ContainerConfig {
    pub fn new<S: Into<String>>(command: impl IntoIterator<Item = S>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Program followed by every argument.
    pub fn argv(&self) -> Vec<String> {
        self.command.iter().chain(self.args.iter()).cloned().collect()
    }
}

fn default_condition() -> String {
    "passed".to_string()
}

fn default_until() -> String {
    "passed".to_string()
}

/// One instruction to the in-container state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Action {
    /// Registers a step with its condition and ancestry
    Declare {
        #[serde(rename = "ref")]
        reference: String,
        #[serde(default = "default_condition")]
        condition: String,
        #[serde(default)]
        parents: Vec<String>,
    },
    /// Requests the step to start paused
    Pause {
        #[serde(rename = "ref")]
        reference: String,
    },
    /// Attaches the expression resolving the step's status at `end`
    Result {
        #[serde(rename = "ref")]
        reference: String,
        value: String,
    },
    Timeout {
        #[serde(rename = "ref")]
        reference: String,
        timeout: String,
    },
    Retry {
        #[serde(rename = "ref")]
        reference: String,
        count: u32,
        #[serde(default = "default_until")]
        until: String,
    },
    /// Switches the environment view for a step subtree
    Container {
        #[serde(rename = "ref")]
        reference: String,
        config: ContainerConfig,
    },
    /// Sets the expression for the aggregate status
    CurrentStatus { status: String },
    Start {
        #[serde(rename = "ref")]
        reference: String,
    },
    End {
        #[serde(rename = "ref")]
        reference: String,
    },
    /// Provisions the runner binary for later containers
    Setup {
        #[serde(default)]
        copy_binaries: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_dir: Option<PathBuf>,
    },
    Execute {
        #[serde(rename = "ref")]
        reference: String,
        #[serde(default)]
        negative: bool,
    },
}

/// Actions run by one container.
pub type ActionGroup = Vec<Action>;

impl Action {
    /// The step this action is about, if any.
    pub fn reference(&self) -> Option<&str> {
        match self {
            Action::Declare { reference, .. }
            | Action::Pause { reference }
            | Action::Result { reference, .. }
            | Action::Timeout { reference, .. }
            | Action::Retry { reference, .. }
            | Action::Container { reference, .. }
            | Action::Start { reference }
            | Action::End { reference }
            | Action::Execute { reference, .. } => Some(reference),
            Action::CurrentStatus { .. } | Action::Setup { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Declare { .. } => "declare",
            Action::Pause { .. } => "pause",
            Action::Result { .. } => "result",
            Action::Timeout { .. } => "timeout",
            Action::Retry { .. } => "retry",
            Action::Container { .. } => "container",
            Action::CurrentStatus { .. } => "current-status",
            Action::Start { .. } => "start",
            Action::End { .. } => "end",
            Action::Setup { .. } => "setup",
            Action::Execute { .. } => "execute",
        }
    }
}

/// Loads action groups from a YAML or JSON file.
pub fn load_groups(path: impl AsRef<Path>) -> Result<Vec<ActionGroup>, ActionError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ActionError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ActionError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_yaml_groups() {
        let yaml = r#"
- - type: setup
    copy_binaries: true
  - type: declare
    ref: root
  - type: container
    ref: root
    config:
      command: ["/bin/true"]
  - type: retry
    ref: root
    count: 2
  - type: execute
    ref: root
    negative: true
- - type: current-status
    status: "root"
"#;
        let groups: Vec<ActionGroup> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(
            groups[0][1],
            Action::Declare {
                reference: "root".into(),
                condition: "passed".into(),
                parents: vec![],
            }
        );
        assert_eq!(
            groups[0][3],
            Action::Retry {
                reference: "root".into(),
                count: 2,
                until: "passed".into(),
            }
        );
        assert_eq!(groups[1][0].kind(), "current-status");
        assert_eq!(groups[0][4].reference(), Some("root"));
    }

    #[test]
    fn test_json_groups() {
        let json = r#"[[{"type":"start","ref":"a"},{"type":"end","ref":"a"}]]"#;
        let groups: Vec<ActionGroup> = serde_json::from_str(json).unwrap();
        assert_eq!(groups[0][0], Action::Start { reference: "a".into() });
        assert_eq!(
            serde_json::to_string(&groups).unwrap(),
            json
        );
    }

    #[test]
    fn test_container_argv() {
        let mut config = ContainerConfig::new(["/bin/sh", "-c"]);
        config.args = vec!["echo hi".into()];
        assert_eq!(config.argv(), vec!["/bin/sh", "-c", "echo hi"]);
    }

    #[test]
    fn test_load_groups_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("groups.json");
        fs::write(&path, r#"[[{"type":"setup"}]]"#).unwrap();

        let groups = load_groups(&path).unwrap();
        assert_eq!(
            groups[0][0],
            Action::Setup {
                copy_binaries: false,
                target_dir: None
            }
        );
    }

    #[test]
    fn test_load_groups_errors() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load_groups(dir.path().join("missing.yaml")),
            Err(ActionError::Io { .. })
        ));

        let path = dir.path().join("bad.yaml");
        fs::write(&path, "- - type: unknown-kind").unwrap();
        assert!(matches!(load_groups(&path), Err(ActionError::Parse { .. })));
    }
}
