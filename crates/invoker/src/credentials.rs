//! Resolved OS identity applied to spawned lambdas and their files.

use std::path::Path;

use nix::unistd::{chown, Gid, Uid, User};
use sp_domain::{Error, Result};

/// Numeric uid/gid pair resolved from the configured user name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    pub uid: u32,
    pub gid: u32,
}

impl Credential {
    /// Resolve a user name to its uid/gid. An empty name means "keep the
    /// daemon's own identity" and resolves to `None`.
    pub fn resolve(user: &str) -> Result<Option<Credential>> {
        if user.is_empty() {
            return Ok(None);
        }
        let entry = User::from_name(user)
            .map_err(|e| Error::Validation(format!("lookup user {user}: {e}")))?
            .ok_or_else(|| Error::Validation(format!("unknown OS user {user}")))?;
        Ok(Some(Credential {
            uid: entry.uid.as_raw(),
            gid: entry.gid.as_raw(),
        }))
    }

    /// Chown `root` and everything under it to this credential.
    pub fn apply_owner(&self, root: &Path) -> Result<()> {
        chown_tree(root, Uid::from_raw(self.uid), Gid::from_raw(self.gid))
    }
}

fn chown_tree(path: &Path, uid: Uid, gid: Gid) -> Result<()> {
    chown(path, Some(uid), Some(gid))
        .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    if path.is_dir() {
        for entry in std::fs::read_dir(path)? {
            chown_tree(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}
