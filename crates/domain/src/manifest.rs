//! Lambda manifest: how a directory of user code is exposed and invoked.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::duration::HumanDuration;
use crate::error::{Error, Result};

/// A scheduled action: `make <action>` fired when the cron expression is due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronEntry {
    pub expression: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "HumanDuration::is_zero")]
    pub time_limit: HumanDuration,
}

/// Per-lambda configuration stored as `manifest.json` beside the lambda's
/// files.
///
/// `run` is the argv of the child process; an empty `run` makes the lambda
/// response-disabled. The `tokens` / `allowed_ip` / `allowed_origin` /
/// `public` fields are the legacy inline policy, migrated into the policy
/// engine when the lambda is first loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Manifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default)]
    pub output_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method_env: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_env: String,
    #[serde(default, skip_serializing_if = "HumanDuration::is_zero")]
    pub time_limit: HumanDuration,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub maximum_payload: u64,
    #[serde(rename = "static", default, skip_serializing_if = "String::is_empty")]
    pub static_dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cron: Vec<CronEntry>,
    /// Mirror of the registry's alias table, kept for export/import.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub aliases: BTreeSet<String>,

    // legacy inline policy, consumed by the startup migration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tokens: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_ip: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_origin: BTreeSet<String>,
    #[serde(default)]
    pub public: bool,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl Manifest {
    /// The manifest of a freshly created example lambda.
    pub fn example() -> Manifest {
        Manifest {
            name: "example-app".into(),
            run: vec![
                "echo".into(),
                "<html><body><h1>Hello world</h1></body></html>".into(),
            ],
            output_headers: BTreeMap::from([("Content-Type".into(), "text/html".into())]),
            public: true,
            ..Manifest::default()
        }
    }

    /// True when the legacy inline fields describe an actual restriction.
    pub fn has_inline_policy(&self) -> bool {
        !self.allowed_ip.is_empty() || !self.allowed_origin.is_empty() || !self.tokens.is_empty()
    }

    /// Drop the legacy inline policy fields (after migration to the engine).
    pub fn strip_inline_policy(&mut self) {
        self.tokens.clear();
        self.allowed_ip.clear();
        self.allowed_origin.clear();
    }

    /// Structural checks applied before a manifest is accepted over the
    /// admin API.
    pub fn validate(&self) -> Result<()> {
        if !self.method.is_empty() && !self.method.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(Error::Validation(format!(
                "method restriction {:?} is not an HTTP method",
                self.method
            )));
        }
        if Path::new(&self.static_dir).is_absolute() {
            return Err(Error::Validation(format!(
                "static directory {:?} must be relative",
                self.static_dir
            )));
        }
        for entry in &self.cron {
            if entry.expression.split_whitespace().count() != 5 {
                return Err(Error::Validation(format!(
                    "cron expression {:?} must have 5 fields",
                    entry.expression
                )));
            }
            if entry.action.is_empty() {
                return Err(Error::Validation(format!(
                    "cron entry {:?} has no action",
                    entry.expression
                )));
            }
        }
        Ok(())
    }

    pub fn load_from(path: &Path) -> Result<Manifest> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Save with write-temp + rename so readers never observe a torn file.
    pub fn save_as(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| Error::Validation(format!("manifest path {} has no parent", path.display())))?;
        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&tmp, self)?;
        tmp.persist(path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}
