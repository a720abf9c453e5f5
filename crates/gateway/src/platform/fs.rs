//! File management of a lambda directory: jailed path resolution, file
//! CRUD, and gzipped tar export/import honoring `.cgiignore`.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tar::{Archive, Builder, EntryType};

use sp_domain::{Error, Manifest, Result, IGNORE_FILE};

use super::lambda::LocalLambda;

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Resolve `rel` against `root`, rejecting any result that escapes the
/// root. `..` is cleaned lexically and refuses to climb past the root;
/// existing targets are additionally canonicalized so symlinks cannot
/// escape either.
pub(crate) fn resolve_path(root: &Path, rel: &str) -> Result<PathBuf> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();
    for comp in Path::new(rel).components() {
        match comp {
            Component::Normal(c) => parts.push(c),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(Error::Forbidden(format!("path {rel:?} escapes lambda root")));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Forbidden(format!("absolute path {rel:?} rejected")));
            }
        }
    }
    let mut path = root.to_path_buf();
    path.extend(parts);
    if path.exists() {
        let real = std::fs::canonicalize(&path)?;
        if real != root && !real.starts_with(root) {
            return Err(Error::Forbidden(format!("path {rel:?} escapes lambda root")));
        }
        return Ok(real);
    }
    Ok(path)
}

impl LocalLambda {
    pub fn list_files(&self, rel: &str) -> Result<Vec<FileEntry>> {
        let path = resolve_path(&self.root, rel)?;
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            entries.push(FileEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn read_file(&self, rel: &str, out: &mut impl Write) -> Result<()> {
        let path = resolve_path(&self.root, rel)?;
        let mut f = std::fs::File::open(path)?;
        std::io::copy(&mut f, out)?;
        Ok(())
    }

    /// Write a file inside the jail. Writing the manifest path goes through
    /// [`LocalLambda::set_manifest`] so the in-memory copy stays in sync.
    pub fn write_file(&self, rel: &str, input: &mut impl Read) -> Result<()> {
        let path = resolve_path(&self.root, rel)?;
        if path == self.manifest_file() {
            let manifest: Manifest = serde_json::from_reader(input)?;
            return self.set_manifest(manifest);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::File::create(&path)?;
        std::io::copy(input, &mut f)?;
        drop(f);
        if let Some(creds) = self.credentials() {
            creds.apply_owner(&path)?;
        }
        Ok(())
    }

    pub fn ensure_dir(&self, rel: &str) -> Result<()> {
        let path = resolve_path(&self.root, rel)?;
        std::fs::create_dir_all(&path)?;
        if let Some(creds) = self.credentials() {
            creds.apply_owner(&path)?;
        }
        Ok(())
    }

    /// Remove a file or directory; the manifest itself is not removable.
    pub fn remove_file(&self, rel: &str) -> Result<()> {
        let path = resolve_path(&self.root, rel)?;
        if path == self.manifest_file() {
            return Err(Error::Forbidden("manifest is not removable".into()));
        }
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn rename_file(&self, src: &str, dest: &str) -> Result<()> {
        let src_path = resolve_path(&self.root, src)?;
        let dest_path = resolve_path(&self.root, dest)?;
        if src_path == dest_path {
            return Ok(());
        }
        if src_path == self.manifest_file() {
            return Err(Error::Forbidden("manifest is not renamable".into()));
        }
        std::fs::rename(src_path, dest_path)?;
        Ok(())
    }

    /// Pack the lambda directory into a gzipped tar, excluding anything
    /// matching a `.cgiignore` glob (one pattern per line).
    pub fn export_tarball(&self, out: &mut impl Write) -> Result<()> {
        let _guard = self.state.read();
        let ignore = self.read_ignore()?;
        let gz = GzEncoder::new(out, Compression::default());
        let mut builder = Builder::new(gz);
        append_dir(&mut builder, &self.root, Path::new(""), &ignore)?;
        let gz = builder.into_inner()?;
        gz.finish()?;
        Ok(())
    }

    /// Replace/overwrite files from a gzipped tar. Only regular files and
    /// directories are accepted; everything lands chowned to the platform
    /// credential and the manifest is re-read afterwards.
    pub fn import_tarball(&self, input: impl Read) -> Result<()> {
        let mut state = self.state.write();
        let mut archive = Archive::new(GzDecoder::new(input));
        for entry in archive.entries()? {
            let mut entry = entry?;
            let rel = entry.path()?.into_owned();
            let rel = rel
                .to_str()
                .ok_or_else(|| Error::Validation(format!("non-UTF8 path in archive: {rel:?}")))?
                .to_string();
            let target = resolve_path(&self.root, &rel)?;
            match entry.header().entry_type() {
                EntryType::Directory => {
                    std::fs::create_dir_all(&target)?;
                }
                EntryType::Regular => {
                    if let Some(parent) = target.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut f = std::fs::File::create(&target)?;
                    std::io::copy(&mut entry, &mut f)?;
                }
                other => {
                    return Err(Error::Validation(format!(
                        "unsupported archive entry {other:?} at {rel}"
                    )));
                }
            }
        }
        if let Some(creds) = state.creds {
            creds.apply_owner(&self.root)?;
        }
        // re-index from disk: the archive may have replaced the manifest
        let manifest = Manifest::load_from(&self.manifest_file())?;
        state.static_dir = super::lambda::resolve_static_dir(&self.root, &manifest);
        state.manifest = manifest;
        Ok(())
    }

    fn read_ignore(&self) -> Result<Vec<glob::Pattern>> {
        let raw = match std::fs::read_to_string(self.root.join(IGNORE_FILE)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut patterns = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match glob::Pattern::new(line) {
                Ok(p) => patterns.push(p),
                Err(e) => {
                    tracing::warn!(pattern = line, error = %e, "skipping invalid ignore pattern");
                }
            }
        }
        Ok(patterns)
    }
}

fn append_dir<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    rel: &Path,
    ignore: &[glob::Pattern],
) -> Result<()> {
    let dir = root.join(rel);
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let rel_path = rel.join(entry.file_name());
        let rel_str = rel_path.to_string_lossy();
        if ignore.iter().any(|p| p.matches(&rel_str)) {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.is_dir() {
            builder.append_dir(&rel_path, entry.path())?;
            append_dir(builder, root, &rel_path, ignore)?;
        } else if meta.is_file() {
            let mut f = std::fs::File::open(entry.path())?;
            builder.append_file(&rel_path, &mut f)?;
        }
        // symlinks and specials are skipped
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::lambda::tests::new_lambda;

    fn cat_lambda(dir: &Path) -> std::sync::Arc<LocalLambda> {
        let mf = Manifest {
            name: "xxx".into(),
            run: vec!["/bin/cat".into(), "-".into()],
            public: true,
            ..Manifest::default()
        };
        new_lambda(dir, mf)
    }

    #[test]
    fn resolve_stays_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        assert!(resolve_path(&root, "a/b.txt").unwrap().starts_with(&root));
        assert!(resolve_path(&root, "a/../b.txt").unwrap().starts_with(&root));
        assert_eq!(resolve_path(&root, "").unwrap(), root);
        assert!(resolve_path(&root, "../escape").is_err());
        assert!(resolve_path(&root, "a/../../escape").is_err());
        assert!(resolve_path(&root, "/etc/passwd").is_err());
    }

    #[test]
    fn resolve_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("root")).unwrap();
        let root = std::fs::canonicalize(dir.path().join("root")).unwrap();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("sneaky")).unwrap();
        assert!(resolve_path(&root, "sneaky").is_err());
    }

    #[test]
    fn file_crud_inside_the_jail() {
        let dir = tempfile::tempdir().unwrap();
        let fn_ = cat_lambda(dir.path());

        fn_.write_file("data/notes.txt", &mut &b"jot"[..]).unwrap();
        let mut out = Vec::new();
        fn_.read_file("data/notes.txt", &mut out).unwrap();
        assert_eq!(out, b"jot");

        let names: Vec<String> = fn_
            .list_files("")
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert!(names.contains(&"data".to_string()));
        assert!(names.contains(&"manifest.json".to_string()));

        fn_.rename_file("data/notes.txt", "data/renamed.txt").unwrap();
        fn_.remove_file("data/renamed.txt").unwrap();
        assert!(fn_.read_file("data/renamed.txt", &mut Vec::new()).is_err());
    }

    #[test]
    fn manifest_is_protected() {
        let dir = tempfile::tempdir().unwrap();
        let fn_ = cat_lambda(dir.path());
        assert!(fn_.remove_file("manifest.json").is_err());
        assert!(fn_.rename_file("manifest.json", "other.json").is_err());
    }

    #[test]
    fn writing_manifest_path_updates_the_cached_copy() {
        let dir = tempfile::tempdir().unwrap();
        let fn_ = cat_lambda(dir.path());
        let mut updated = fn_.manifest();
        updated.name = "via-file".into();
        let raw = serde_json::to_vec(&updated).unwrap();
        fn_.write_file("manifest.json", &mut raw.as_slice()).unwrap();
        assert_eq!(fn_.manifest().name, "via-file");
    }

    #[test]
    fn export_import_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fn_ = cat_lambda(dir.path());
        std::fs::create_dir(fn_.root().join("test")).unwrap();
        std::fs::write(fn_.root().join("test/test.txt"), "hello").unwrap();

        let mut tarball = Vec::new();
        fn_.export_tarball(&mut tarball).unwrap();

        let dir2 = tempfile::tempdir().unwrap();
        let fn2 = new_lambda(dir2.path(), Manifest::default());
        fn2.import_tarball(tarball.as_slice()).unwrap();

        assert_eq!(
            std::fs::read_to_string(fn2.root().join("test/test.txt")).unwrap(),
            "hello"
        );
        // manifest came from the archive and replaced the in-memory copy
        assert_eq!(fn2.manifest().name, "xxx");
    }

    #[test]
    fn export_honors_cgiignore() {
        let dir = tempfile::tempdir().unwrap();
        let fn_ = cat_lambda(dir.path());
        std::fs::write(fn_.root().join("keep.txt"), "keep").unwrap();
        std::fs::write(fn_.root().join("secret.key"), "shh").unwrap();
        std::fs::write(fn_.root().join(".cgiignore"), "*.key\n").unwrap();

        let mut tarball = Vec::new();
        fn_.export_tarball(&mut tarball).unwrap();

        let mut archive = Archive::new(GzDecoder::new(tarball.as_slice()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains(&"keep.txt".to_string()));
        assert!(!names.contains(&"secret.key".to_string()));
    }

    #[test]
    fn import_rejects_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let fn_ = cat_lambda(dir.path());

        // craft an archive with a traversal path at the byte level; the tar
        // crate's builder refuses to create one
        let mut raw: Vec<u8> = Vec::new();
        {
            let mut header = [0u8; 512];
            let name = b"../../evil.txt";
            header[..name.len()].copy_from_slice(name);
            header[100..108].copy_from_slice(b"0000644\0");
            header[108..116].copy_from_slice(b"0000000\0");
            header[116..124].copy_from_slice(b"0000000\0");
            header[124..136].copy_from_slice(b"00000000004\0");
            header[136..148].copy_from_slice(b"00000000000\0");
            header[156] = b'0';
            header[257..263].copy_from_slice(b"ustar\0");
            header[263..265].copy_from_slice(b"00");
            header[148..156].copy_from_slice(b"        ");
            let cksum: u32 = header.iter().map(|&b| b as u32).sum();
            let cksum = format!("{cksum:06o}\0 ");
            header[148..156].copy_from_slice(&cksum.as_bytes()[..8]);
            raw.extend_from_slice(&header);
            raw.extend_from_slice(b"evil");
            raw.extend_from_slice(&[0u8; 508]);
            raw.extend_from_slice(&[0u8; 1024]);
        }
        let mut gz = GzEncoder::new(Vec::new(), Compression::fast());
        gz.write_all(&raw).unwrap();
        let compressed = gz.finish().unwrap();

        assert!(fn_.import_tarball(compressed.as_slice()).is_err());
        assert!(!dir.path().parent().unwrap().join("evil.txt").exists());
    }
}
