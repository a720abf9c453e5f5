//! Project workspace: scans the project root for lambda directories and
//! carries the lifecycle use-cases (create empty / from template / from
//! git, removal cascade, legacy manifest migration).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use sp_domain::{Error, Manifest, PolicyDefinition, Result};
use sp_invoker::InvokeSpec;

use crate::keys::SshKey;
use crate::policy;
use crate::templates::{Template, TemplateStore};

use super::lambda::LocalLambda;
use super::registry::{Definition, Registry};

pub struct Workspace {
    dir: PathBuf,
    registry: Arc<Registry>,
    policies: Arc<policy::Engine>,
    templates: Arc<TemplateStore>,
    ssh: Option<Arc<SshKey>>,
}

impl Workspace {
    pub fn new(
        dir: impl Into<PathBuf>,
        registry: Arc<Registry>,
        policies: Arc<policy::Engine>,
        templates: Arc<TemplateStore>,
        ssh: Option<Arc<SshKey>>,
    ) -> Workspace {
        Workspace {
            dir: dir.into(),
            registry,
            policies,
            templates,
            ssh,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn templates(&self) -> &Arc<TemplateStore> {
        &self.templates
    }

    pub fn public_ssh_key(&self) -> Result<String> {
        self.ssh
            .as_ref()
            .ok_or_else(|| Error::NotFound("SSH key is not configured".into()))?
            .public_key()
    }

    /// Register every UUID-shaped directory under the project root and
    /// migrate legacy manifests (inline aliases and policy fields).
    pub fn scan(&self) -> Result<()> {
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !entry.file_type()?.is_dir() || Uuid::parse_str(&name).is_err() {
                continue;
            }
            let lambda = LocalLambda::from_dir(entry.path())
                .map_err(|e| Error::Validation(format!("load lambda {name}: {e}")))?;
            self.registry.add(&name, lambda.clone())?;
            self.apply_migration(&name, &lambda)?;
        }
        Ok(())
    }

    /// Create an empty lambda (no command, no files beyond the manifest).
    pub fn create(&self) -> Result<Definition> {
        self.materialize(Template::default())
    }

    pub fn create_from_template(&self, name: &str) -> Result<Definition> {
        let template = self
            .templates
            .find(name)?
            .ok_or_else(|| Error::NotFound(format!("template {name} does not exist")))?;
        self.materialize(template)
    }

    /// Clone a Git repository as a new lambda using the platform SSH key.
    /// The repository must carry a `manifest.json` of its own.
    pub async fn create_from_git(
        &self,
        cancel: &CancellationToken,
        repo: &str,
    ) -> Result<Definition> {
        let ssh = self
            .ssh
            .as_ref()
            .ok_or_else(|| Error::Validation("can't clone from Git while SSH key not set".into()))?
            .clone();
        let uid = Uuid::new_v4().to_string();
        let path = self.dir.join(&uid);
        std::fs::create_dir_all(&path)?;

        let argv = vec![
            "git".to_string(),
            "clone".to_string(),
            "--depth".to_string(),
            "1".to_string(),
            repo.to_string(),
            ".".to_string(),
        ];
        let mut env = std::collections::BTreeMap::new();
        env.insert("GIT_SSH_COMMAND".to_string(), ssh.git_ssh_command());
        let mut sink = tokio::io::sink();
        let cloned = sp_invoker::invoke(
            cancel,
            InvokeSpec {
                argv: &argv,
                cwd: &path,
                env: &env,
                credentials: None,
                time_limit: std::time::Duration::ZERO,
                max_payload: 0,
            },
            tokio::io::empty(),
            &mut sink,
        )
        .await;
        if let Err(e) = cloned {
            let _ = std::fs::remove_dir_all(&path);
            return Err(Error::RuntimeFailure(format!("clone {repo}: {e}")));
        }

        let lambda = match LocalLambda::from_dir(&path) {
            Ok(lambda) => lambda,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&path);
                return Err(Error::Validation(format!(
                    "cloned repository has no usable manifest: {e}"
                )));
            }
        };
        self.registry.add(&uid, lambda)?;
        self.registry.find_by_uid(&uid)
    }

    /// Remove a lambda: drop it (and its aliases) from the index, clear its
    /// policy binding and delete the directory. Queues targeting the UID
    /// are retained; their deliveries fail until reassigned.
    pub fn remove(&self, uid: &str) -> Result<()> {
        let def = self.registry.find_by_uid(uid)?;
        self.registry.remove(uid)?;
        if let Err(e) = self.policies.clear(uid) {
            tracing::error!(uid, error = %e, "failed to clear policy binding");
        }
        def.lambda.remove()
    }

    /// Bind an alias and refresh the manifest's alias mirror (used by
    /// export).
    pub fn link(&self, uid: &str, alias: &str) -> Result<Definition> {
        let def = self.registry.link(uid, alias)?;
        self.sync_alias_mirror(&def);
        Ok(def)
    }

    pub fn unlink(&self, alias: &str) -> Result<Option<Definition>> {
        let def = self.registry.unlink(alias)?;
        if let Some(def) = &def {
            self.sync_alias_mirror(def);
        }
        Ok(def)
    }

    fn sync_alias_mirror(&self, def: &Definition) {
        let mut manifest = def.lambda.manifest();
        if manifest.aliases == def.aliases {
            return;
        }
        manifest.aliases = def.aliases.clone();
        if let Err(e) = def.lambda.set_manifest(manifest) {
            tracing::warn!(uid = %def.uid, error = %e, "failed to mirror aliases into manifest");
        }
    }

    fn materialize(&self, template: Template) -> Result<Definition> {
        let uid = Uuid::new_v4().to_string();
        let path = self.dir.join(&uid);
        std::fs::create_dir_all(&path)?;
        let created = self.materialize_at(&path, &template);
        match created {
            Ok(lambda) => {
                if let Err(e) = self.registry.add(&uid, lambda) {
                    let _ = std::fs::remove_dir_all(&path);
                    return Err(e);
                }
                self.registry.find_by_uid(&uid)
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&path);
                Err(e)
            }
        }
    }

    fn materialize_at(&self, path: &Path, template: &Template) -> Result<Arc<LocalLambda>> {
        for (rel, content) in &template.files {
            let target = super::fs::resolve_path(path, rel)?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(target, content)?;
        }
        template.manifest.save_as(&path.join(sp_domain::MANIFEST_FILE))?;
        LocalLambda::from_dir(path)
    }

    /// Legacy manifests carried aliases and inline policy fields; move the
    /// aliases into the registry and the policy into the engine, then
    /// re-save the manifest without the inline policy.
    fn apply_migration(&self, uid: &str, lambda: &Arc<LocalLambda>) -> Result<()> {
        let manifest = lambda.manifest();
        for alias in &manifest.aliases {
            match self.registry.link(uid, alias) {
                Ok(_) | Err(Error::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if !manifest.has_inline_policy() {
            return Ok(());
        }
        let policy_id = format!("{uid}-{}", manifest.name);
        let definition = PolicyDefinition {
            allowed_ip: manifest.allowed_ip.clone(),
            allowed_origin: manifest.allowed_origin.clone(),
            public: manifest.public,
            tokens: manifest.tokens.clone(),
        };
        self.policies.create(&policy_id, definition)?;
        self.policies.apply(uid, &policy_id)?;
        let mut stripped = manifest;
        stripped.strip_inline_policy();
        lambda.set_manifest(stripped)
    }
}
