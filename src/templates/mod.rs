//! Template store
//!
//! Templates are the recipes servers are provisioned from: image set,
//! install script, start/stop behavior, and the variable schema. The store
//! is read-only from the lifecycle engine's point of view.

use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::error::{DaemonError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub description: String,

    pub docker: TemplateDocker,

    #[serde(default)]
    pub variables: Vec<Variable>,

    pub install_script: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateDocker {
    #[serde(default)]
    pub images: Vec<String>,

    /// JSON document describing start behavior; see [`StartConfig`].
    #[serde(default)]
    pub start_config: String,

    #[serde(default)]
    pub stop_command: String,

    #[serde(default)]
    pub config_files: Vec<ConfigFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub description: String,
    pub environment_name: String,

    #[serde(default, rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub rules: Vec<String>,
}

/// Parsed form of `TemplateDocker::start_config`.
///
/// `started` is the log-line marker that signals the workload finished
/// starting; empty or missing means "running as soon as the container is".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartConfig {
    #[serde(default)]
    pub started: String,
}

impl Template {
    /// Decode `start_config` into a fresh struct; malformed or empty
    /// documents yield the default.
    pub fn start_config(&self) -> StartConfig {
        serde_json::from_str(&self.docker.start_config).unwrap_or_default()
    }
}

/// In-memory template set backed by `<data>/templates/*.json`.
pub struct TemplateStore {
    dir: PathBuf,
    templates: RwLock<Vec<Template>>,
}

impl TemplateStore {
    pub fn new(config: &Config) -> Self {
        Self {
            dir: config.templates_dir(),
            templates: RwLock::new(Vec::new()),
        }
    }

    /// Load every template record from disk. Undecodable files are skipped
    /// with a warning.
    pub fn load(&self) -> Result<usize> {
        let mut loaded = Vec::new();

        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<Template>(&content) {
                Ok(template) => loaded.push(template),
                Err(e) => warn!("skipping template {}: {}", path.display(), e),
            }
        }

        let count = loaded.len();
        *self.templates.write() = loaded;
        Ok(count)
    }

    pub fn all(&self) -> Vec<Template> {
        self.templates.read().clone()
    }

    pub fn get(&self, id: i64) -> Result<Template> {
        self.templates
            .read()
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| DaemonError::NotFound(format!("template {id}")))
    }

    /// Register a template and persist it as `<data>/templates/<uuid>.json`.
    pub fn add(&self, template: Template) -> Result<()> {
        let body = serde_json::to_string_pretty(&template)?;
        std::fs::write(self.dir.join(format!("{}.json", template.uuid)), body)?;

        self.templates.write().push(template);
        Ok(())
    }
}

/// Canned template used by `--test` mode.
pub fn test_template() -> Template {
    Template {
        id: 1,
        uuid: uuid::Uuid::new_v4().to_string(),
        name: "Test".into(),
        description: "Template used in testing mode".into(),
        docker: TemplateDocker {
            images: vec!["alpine:3".into()],
            start_config: r#"{"started":"ready"}"#.into(),
            stop_command: String::new(),
            config_files: Vec::new(),
        },
        variables: Vec::new(),
        install_script: "#!/bin/sh\necho installing\n".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_config_decodes_into_fresh_struct() {
        let mut template = test_template();
        assert_eq!(template.start_config().started, "ready");

        template.docker.start_config = String::new();
        assert_eq!(template.start_config().started, "");

        template.docker.start_config = "not json".into();
        assert_eq!(template.start_config().started, "");
    }

    #[test]
    fn store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default_config("config.yml");
        config.system.data = dir.path().to_string_lossy().into_owned();
        std::fs::create_dir_all(config.templates_dir()).unwrap();

        let store = TemplateStore::new(&config);
        store.add(test_template()).unwrap();

        let reloaded = TemplateStore::new(&config);
        assert_eq!(reloaded.load().unwrap(), 1);

        let template = reloaded.get(1).unwrap();
        assert_eq!(template.name, "Test");
        assert_eq!(template.start_config().started, "ready");

        assert!(matches!(
            reloaded.get(42),
            Err(DaemonError::NotFound(_))
        ));
    }
}
