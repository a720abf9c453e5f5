//! In-memory authoritative index of lambdas by UID and alias, persisted
//! through the project configuration file.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use sp_domain::config::valid_name;
use sp_domain::{Error, Manifest, ProjectConfig, Result};
use sp_invoker::Credential;

use super::lambda::LocalLambda;

/// Registry view of one lambda: UID, aliases and the runtime handle.
#[derive(Clone, Debug)]
pub struct Definition {
    pub uid: String,
    pub aliases: BTreeSet<String>,
    pub manifest: Manifest,
    pub lambda: Arc<LocalLambda>,
}

struct Record {
    lambda: Arc<LocalLambda>,
    aliases: BTreeSet<String>,
}

impl Record {
    fn to_definition(&self, uid: &str) -> Definition {
        Definition {
            uid: uid.to_string(),
            aliases: self.aliases.clone(),
            manifest: self.lambda.manifest(),
            lambda: self.lambda.clone(),
        }
    }
}

struct RegistryState {
    config: ProjectConfig,
    creds: Option<Credential>,
    by_uid: HashMap<String, Record>,
}

pub struct Registry {
    config_path: PathBuf,
    inner: RwLock<RegistryState>,
}

impl Registry {
    /// Load (or initialize) the project configuration and resolve the
    /// effective user. `default_user` seeds a fresh configuration only.
    pub fn open(config_path: impl Into<PathBuf>, default_user: &str) -> Result<Registry> {
        let config_path = config_path.into();
        let config = match ProjectConfig::load_from(&config_path) {
            Ok(config) => config,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => ProjectConfig {
                user: default_user.to_string(),
                ..ProjectConfig::default()
            },
            Err(e) => return Err(e),
        };
        let creds = Credential::resolve(&config.user)?;
        config.save_as(&config_path)?;
        Ok(Registry {
            config_path,
            inner: RwLock::new(RegistryState {
                config,
                creds,
                by_uid: HashMap::new(),
            }),
        })
    }

    pub fn credentials(&self) -> Option<Credential> {
        self.inner.read().creds
    }

    pub fn config(&self) -> ProjectConfig {
        self.inner.read().config.clone()
    }

    /// Replace the configuration: re-resolve the OS user, persist, then
    /// push the credential to every registered lambda (which chowns its
    /// files on change).
    pub fn set_config(&self, mut config: ProjectConfig) -> Result<()> {
        let mut state = self.inner.write();
        // links are registry-owned; keep the live table
        config.links = state.config.links.clone();
        let creds = Credential::resolve(&config.user)?;
        config.save_as(&self.config_path)?;
        state.config = config;
        state.creds = creds;
        for (uid, record) in &state.by_uid {
            record
                .lambda
                .set_credentials(creds)
                .map_err(|e| Error::RuntimeFailure(format!("set credentials for {uid}: {e}")))?;
        }
        Ok(())
    }

    /// Index a lambda. Registering the same UID with a different handle is
    /// a conflict. Aliases already present in the configuration are
    /// restored, and the platform credential is applied on first add.
    pub fn add(&self, uid: &str, lambda: Arc<LocalLambda>) -> Result<()> {
        if !valid_name(uid) {
            return Err(Error::Validation(format!("invalid lambda UID {uid:?}")));
        }
        let mut state = self.inner.write();
        if let Some(existing) = state.by_uid.get(uid) {
            if !Arc::ptr_eq(&existing.lambda, &lambda) {
                return Err(Error::Conflict(format!(
                    "lambda {uid} already exists and is different"
                )));
            }
            return Ok(());
        }
        let aliases = state
            .config
            .links
            .iter()
            .filter(|(_, target)| target.as_str() == uid)
            .map(|(alias, _)| alias.clone())
            .collect();
        let creds = state.creds;
        state.by_uid.insert(
            uid.to_string(),
            Record {
                lambda: lambda.clone(),
                aliases,
            },
        );
        drop(state);
        lambda.set_credentials(creds)?;
        Ok(())
    }

    /// Drop a lambda and all of its aliases from the index. The directory
    /// itself is the caller's concern.
    pub fn remove(&self, uid: &str) -> Result<Option<Arc<LocalLambda>>> {
        let mut state = self.inner.write();
        let record = state.by_uid.remove(uid);
        if let Some(record) = &record {
            for alias in &record.aliases {
                state.config.links.remove(alias);
            }
            state.config.save_as(&self.config_path)?;
        }
        Ok(record.map(|r| r.lambda))
    }

    /// Bind an alias to a UID. Fails when the alias already points at a
    /// different lambda; idempotent for the same one.
    pub fn link(&self, uid: &str, alias: &str) -> Result<Definition> {
        if !valid_name(uid) {
            return Err(Error::Validation(format!("invalid target UID {uid:?}")));
        }
        if !valid_name(alias) {
            return Err(Error::Validation(format!("invalid alias {alias:?}")));
        }
        let mut state = self.inner.write();
        if !state.by_uid.contains_key(uid) {
            return Err(Error::NotFound(format!("unknown target lambda {uid}")));
        }
        if let Some(bound) = state.config.links.get(alias) {
            if bound != uid {
                return Err(Error::Conflict(format!(
                    "alias {alias} already points to lambda {bound}"
                )));
            }
        }
        state.config.links.insert(alias.to_string(), uid.to_string());
        state
            .by_uid
            .get_mut(uid)
            .expect("checked above")
            .aliases
            .insert(alias.to_string());
        state.config.save_as(&self.config_path)?;
        Ok(state.by_uid[uid].to_definition(uid))
    }

    /// Remove an alias; returns the definition it pointed at, if any.
    pub fn unlink(&self, alias: &str) -> Result<Option<Definition>> {
        if !valid_name(alias) {
            return Err(Error::Validation(format!("invalid alias {alias:?}")));
        }
        let mut state = self.inner.write();
        let uid = state.config.links.remove(alias);
        let def = match uid {
            Some(uid) => {
                if let Some(record) = state.by_uid.get_mut(&uid) {
                    record.aliases.remove(alias);
                }
                state.by_uid.get(&uid).map(|r| r.to_definition(&uid))
            }
            None => None,
        };
        state.config.save_as(&self.config_path)?;
        Ok(def)
    }

    pub fn find_by_uid(&self, uid: &str) -> Result<Definition> {
        let state = self.inner.read();
        state
            .by_uid
            .get(uid)
            .map(|r| r.to_definition(uid))
            .ok_or_else(|| Error::NotFound(format!("unknown lambda with UID {uid}")))
    }

    pub fn find_by_link(&self, alias: &str) -> Result<Definition> {
        let state = self.inner.read();
        let uid = state
            .config
            .links
            .get(alias)
            .ok_or_else(|| Error::NotFound(format!("unknown lambda with alias {alias}")))?;
        state
            .by_uid
            .get(uid)
            .map(|r| r.to_definition(uid))
            .ok_or_else(|| {
                Error::Corruption(format!("broken link {alias}: unknown lambda {uid}"))
            })
    }

    pub fn list(&self) -> Vec<Definition> {
        let state = self.inner.read();
        let mut defs: Vec<Definition> = state
            .by_uid
            .iter()
            .map(|(uid, record)| record.to_definition(uid))
            .collect();
        defs.sort_by(|a, b| a.uid.cmp(&b.uid));
        defs
    }

    /// Global environment merged into every invocation.
    pub fn global_env(&self) -> std::collections::BTreeMap<String, String> {
        self.inner.read().config.environment.clone()
    }
}
