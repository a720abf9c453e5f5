//! Per-project control file linking a local working copy to its remote
//! lambda, excluded from uploads through `.cgiignore`.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use sp_domain::IGNORE_FILE;

pub const CONTROL_FILE: &str = ".spctl.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ControlFile {
    pub url: String,
    pub uid: String,
}

impl ControlFile {
    pub fn load(dir: &Path) -> anyhow::Result<ControlFile> {
        let path = dir.join(CONTROL_FILE);
        let data =
            std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let path = dir.join(CONTROL_FILE);
        std::fs::write(&path, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("writing {}", path.display()))?;
        // keep the control file out of uploads
        append_if_no_line(&dir.join(IGNORE_FILE), CONTROL_FILE)
    }
}

/// Append `line` to the file unless an identical line is already present.
fn append_if_no_line(path: &Path, line: &str) -> anyhow::Result<()> {
    let existing = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    if existing.lines().any(|l| l.trim() == line) {
        return Ok(());
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cf = ControlFile {
            url: "http://127.0.0.1:3434/".into(),
            uid: "some-uid".into(),
        };
        cf.save(dir.path()).unwrap();
        assert_eq!(ControlFile::load(dir.path()).unwrap(), cf);
        // control file is ignored for uploads
        let ignore = std::fs::read_to_string(dir.path().join(IGNORE_FILE)).unwrap();
        assert!(ignore.lines().any(|l| l == CONTROL_FILE));
    }

    #[test]
    fn ignore_line_is_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let cf = ControlFile::default();
        cf.save(dir.path()).unwrap();
        cf.save(dir.path()).unwrap();
        let ignore = std::fs::read_to_string(dir.path().join(IGNORE_FILE)).unwrap();
        assert_eq!(
            ignore.lines().filter(|l| *l == CONTROL_FILE).count(),
            1
        );
    }
}
