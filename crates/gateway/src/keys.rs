//! Platform SSH key used for cloning lambdas from private Git remotes.
//!
//! The key is generated on first run by shelling out to `ssh-keygen`
//! (RSA 3072, empty passphrase), which also leaves the `.pub` companion
//! file the admin API exposes.

use std::path::{Path, PathBuf};

use sp_domain::{Error, Result};

const KEY_BITS: &str = "3072";

pub struct SshKey {
    path: PathBuf,
}

impl SshKey {
    /// Use the key at `path`, generating it when absent.
    pub async fn ensure(path: impl Into<PathBuf>) -> Result<SshKey> {
        let path = path.into();
        if !path.exists() {
            generate(&path).await?;
        }
        Ok(SshKey { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content of the public half (`<key>.pub`).
    pub fn public_key(&self) -> Result<String> {
        let pub_path = public_path(&self.path);
        std::fs::read_to_string(&pub_path)
            .map_err(|e| Error::NotFound(format!("public key {}: {e}", pub_path.display())))
    }

    /// `GIT_SSH_COMMAND` value that pins this identity.
    pub fn git_ssh_command(&self) -> String {
        format!(
            "ssh -i {} -o IdentitiesOnly=yes -o StrictHostKeyChecking=accept-new",
            self.path.display()
        )
    }
}

fn public_path(private: &Path) -> PathBuf {
    let mut name = private.file_name().unwrap_or_default().to_os_string();
    name.push(".pub");
    private.with_file_name(name)
}

async fn generate(path: &Path) -> Result<()> {
    tracing::info!(path = %path.display(), "generating ssh key");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let status = tokio::process::Command::new("ssh-keygen")
        .args(["-q", "-t", "rsa", "-b", KEY_BITS, "-N", "", "-f"])
        .arg(path)
        .status()
        .await
        .map_err(|e| Error::SpawnFailure(format!("ssh-keygen: {e}")))?;
    if !status.success() {
        return Err(Error::RuntimeFailure(format!(
            "ssh-keygen exited with {status}"
        )));
    }
    Ok(())
}
