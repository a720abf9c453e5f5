//! Starter templates: `.templates/*.json` files describing seed files and
//! a manifest for new lambdas.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use sp_domain::{Manifest, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Binary (or script) that must be present for the template to be
    /// usable on this host; empty means always available.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub check_binary: String,
    #[serde(default)]
    pub manifest: Manifest,
    /// Relative path → file content.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl Template {
    pub fn is_available(&self) -> bool {
        if self.check_binary.is_empty() {
            return true;
        }
        which(&self.check_binary)
    }
}

pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> TemplateStore {
        TemplateStore { dir: dir.into() }
    }

    /// All templates keyed by file stem; a missing directory is empty.
    pub fn list(&self) -> Result<BTreeMap<String, Template>> {
        let mut templates = BTreeMap::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(templates),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match std::fs::read(&path).map_err(Into::into).and_then(|data| {
                serde_json::from_slice::<Template>(&data).map_err(sp_domain::Error::from)
            }) {
                Ok(template) => {
                    templates.insert(stem.to_string(), template);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping broken template");
                }
            }
        }
        Ok(templates)
    }

    pub fn find(&self, name: &str) -> Result<Option<Template>> {
        Ok(self.list()?.remove(name))
    }
}

fn which(binary: &str) -> bool {
    if binary.contains('/') {
        return Path::new(binary).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
        })
        .unwrap_or(false)
}
