//! A single addressable lambda: a directory with a manifest and an
//! executable command, plus file management and scheduled actions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

use sp_domain::{CapturedRequest, Error, Manifest, Result, MANIFEST_FILE};
use sp_invoker::{Credential, InvokeSpec};

#[derive(Debug)]
pub struct LocalLambda {
    pub(crate) root: PathBuf,
    pub(crate) uid: String,
    pub(crate) state: RwLock<LambdaState>,
}

#[derive(Debug)]
pub(crate) struct LambdaState {
    pub(crate) manifest: Manifest,
    pub(crate) static_dir: Option<PathBuf>,
    pub(crate) creds: Option<Credential>,
}

impl LocalLambda {
    /// Load a lambda from its directory; the directory base name is the UID.
    pub fn from_dir(path: impl Into<PathBuf>) -> Result<Arc<LocalLambda>> {
        let root = std::fs::canonicalize(path.into())?;
        let uid = root
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Validation(format!("{} has no directory name", root.display())))?
            .to_string();
        let manifest = Manifest::load_from(&root.join(MANIFEST_FILE))?;
        let static_dir = resolve_static_dir(&root, &manifest);
        Ok(Arc::new(LocalLambda {
            root,
            uid,
            state: RwLock::new(LambdaState {
                manifest,
                static_dir,
                creds: None,
            }),
        }))
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> Manifest {
        self.state.read().manifest.clone()
    }

    /// Persist and swap the manifest; readers observe either the old or the
    /// new (file, memory) pair.
    pub fn set_manifest(&self, manifest: Manifest) -> Result<()> {
        let mut state = self.state.write();
        manifest.save_as(&self.manifest_file())?;
        state.static_dir = resolve_static_dir(&self.root, &manifest);
        state.manifest = manifest;
        Ok(())
    }

    pub fn credentials(&self) -> Option<Credential> {
        self.state.read().creds
    }

    /// Update the run-as credential; on change every file of the lambda is
    /// chowned to the new owner.
    pub fn set_credentials(&self, creds: Option<Credential>) -> Result<()> {
        let mut state = self.state.write();
        if state.creds == creds {
            return Ok(());
        }
        state.creds = creds;
        drop(state);
        if let Some(creds) = creds {
            creds.apply_owner(&self.root)?;
        }
        Ok(())
    }

    /// Delete the lambda's directory. The registry entry is the caller's
    /// concern.
    pub fn remove(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.root)?;
        Ok(())
    }

    pub(crate) fn manifest_file(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Handle one request: serve static content for GET/HEAD when
    /// configured, otherwise spawn `run` with the request on stdin and
    /// stream stdout into `out`.
    pub async fn invoke<W>(
        &self,
        cancel: &CancellationToken,
        mut request: CapturedRequest,
        out: &mut W,
        global_env: &BTreeMap<String, String>,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        // snapshot under the read lock; the invocation itself runs without
        // holding it so manifest updates never wait on a slow child
        let (manifest, static_dir, creds) = {
            let state = self.state.read();
            (
                state.manifest.clone(),
                state.static_dir.clone(),
                state.creds,
            )
        };

        if let Some(static_dir) = static_dir {
            if request.method == "GET" || request.method == "HEAD" {
                return self.serve_static(&static_dir, &request, out).await;
            }
        }

        if manifest.run.is_empty() {
            return Err(Error::NotFound("run is not defined in manifest".into()));
        }

        if !manifest.method.is_empty() && !manifest.method.eq_ignore_ascii_case(&request.method) {
            return Err(Error::MethodNotAllowed(format!(
                "lambda accepts only {}",
                manifest.method
            )));
        }

        let mut env = global_env.clone();
        for (header, var) in &manifest.input_headers {
            env.insert(
                var.clone(),
                request.header(header).unwrap_or_default().to_string(),
            );
        }
        for (param, var) in &manifest.query {
            env.insert(
                var.clone(),
                request.form.get(param).cloned().unwrap_or_default(),
            );
        }
        if !manifest.method_env.is_empty() {
            env.insert(manifest.method_env.clone(), request.method.clone());
        }
        if !manifest.path_env.is_empty() {
            env.insert(manifest.path_env.clone(), request.path.clone());
        }
        for (k, v) in &manifest.environment {
            env.insert(k.clone(), v.clone());
        }

        let body = request.take_body();
        sp_invoker::invoke(
            cancel,
            InvokeSpec {
                argv: &manifest.run,
                cwd: &self.root,
                env: &env,
                credentials: creds,
                time_limit: manifest.time_limit.as_duration(),
                max_payload: manifest.maximum_payload,
            },
            body.into_reader(),
            out,
        )
        .await
    }

    /// Copy a file from the static directory. The first path segment is the
    /// mount name (uid or alias) and is dropped; directories fall back to
    /// their `index.html`.
    async fn serve_static<W>(
        &self,
        static_dir: &Path,
        request: &CapturedRequest,
        out: &mut W,
    ) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let trimmed = request.path.trim_matches('/');
        let file = match trimmed.split_once('/') {
            Some((_, rest)) => rest,
            None => "",
        };
        let file = if file.is_empty() { "index.html" } else { file };
        let mut target = super::fs::resolve_path(static_dir, file)?;
        if target.is_dir() {
            target = target.join("index.html");
        }
        let mut f = tokio::fs::File::open(&target)
            .await
            .map_err(|_| Error::NotFound(format!("no static file for {}", request.path)))?;
        tokio::io::copy(&mut f, out).await?;
        Ok(())
    }
}

pub(crate) fn resolve_static_dir(root: &Path, manifest: &Manifest) -> Option<PathBuf> {
    if manifest.static_dir.is_empty() {
        None
    } else {
        Some(root.join(&manifest.static_dir))
    }
}
