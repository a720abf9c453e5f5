//! Persisted platform state: project configuration, queue descriptors and
//! policies, plus the name validation shared by registry and queue manager.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::duration::HumanDuration;
use crate::error::{Error, Result};

/// UID / alias shape: directory-name safe token.
pub fn valid_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]{1,255}$").expect("name regex"))
        .is_match(name)
}

/// Queue names are stricter: URL-path safe, bounded length.
pub fn valid_queue_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9-]{3,64}$").expect("queue name regex"))
        .is_match(name)
}

/// Platform configuration persisted as `project.json` in the project root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// OS user that spawned lambdas run as; empty keeps the daemon's own
    /// identity.
    #[serde(default)]
    pub user: String,
    /// Environment merged into every invocation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Alias → UID.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, String>,
}

impl ProjectConfig {
    pub fn load_from(path: &Path) -> Result<ProjectConfig> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save_as(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }
}

/// Descriptor of a durable queue bound to a target lambda.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    /// UID of the lambda messages are delivered to.
    pub target: String,
    /// Number of additional delivery attempts; negative means practically
    /// unbounded.
    #[serde(default)]
    pub retry: i64,
    /// Cap on *pending message count* (the name is historical).
    #[serde(default)]
    pub max_element_size: i64,
    /// Delay between attempts for a single message.
    #[serde(default)]
    pub interval: HumanDuration,
}

impl QueueDescriptor {
    /// Attempts a worker makes per message: 1 + retry, clamped for
    /// negative retry to a practically unbounded count.
    pub fn attempts(&self) -> u64 {
        if self.retry < 0 {
            u64::MAX
        } else {
            self.retry as u64 + 1
        }
    }
}

/// Reusable access rule set, bindable to at most one lambda at a time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_ip: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub allowed_origin: BTreeSet<String>,
    #[serde(default)]
    pub public: bool,
    /// Authorization header value → label.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tokens: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub definition: PolicyDefinition,
    /// UIDs the policy is applied to (reverse of the engine's index).
    #[serde(default)]
    pub lambdas: BTreeSet<String>,
}

/// Write-temp + rename so concurrent readers see either the old or the new
/// file, never a partial one.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Validation(format!("{} has no parent directory", path.display())))?;
    let tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&tmp, value)?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
