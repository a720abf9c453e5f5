//! Local tar.gz packing/unpacking of a lambda working copy, honoring the
//! same `.cgiignore` glob list the platform uses on export.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType};

use sp_domain::IGNORE_FILE;

/// Pack `dir` into a gzipped tarball.
pub fn pack(dir: &Path) -> anyhow::Result<Vec<u8>> {
    let ignore = read_ignore(dir)?;
    let gz = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(gz);
    append_dir(&mut builder, dir, Path::new(""), &ignore)?;
    let gz = builder.into_inner()?;
    Ok(gz.finish()?)
}

/// Unpack a gzipped tarball into `dir`, accepting only regular files and
/// directories with safe relative paths.
pub fn unpack(data: &[u8], dir: &Path) -> anyhow::Result<()> {
    let mut archive = Archive::new(GzDecoder::new(data));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let rel = entry.path()?.into_owned();
        let target = safe_join(dir, &rel)?;
        match entry.header().entry_type() {
            EntryType::Directory => {
                std::fs::create_dir_all(&target)?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut f = std::fs::File::create(&target)
                    .with_context(|| format!("creating {}", target.display()))?;
                std::io::copy(&mut entry, &mut f)?;
            }
            other => bail!("unsupported archive entry {other:?} at {}", rel.display()),
        }
    }
    Ok(())
}

fn safe_join(dir: &Path, rel: &Path) -> anyhow::Result<PathBuf> {
    let mut out = dir.to_path_buf();
    for comp in rel.components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            _ => bail!("unsafe path in archive: {}", rel.display()),
        }
    }
    Ok(out)
}

fn read_ignore(dir: &Path) -> anyhow::Result<Vec<glob::Pattern>> {
    let raw = match std::fs::read_to_string(dir.join(IGNORE_FILE)) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(raw
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| glob::Pattern::new(line.trim()).ok())
        .collect())
}

fn append_dir<W: std::io::Write>(
    builder: &mut Builder<W>,
    root: &Path,
    rel: &Path,
    ignore: &[glob::Pattern],
) -> anyhow::Result<()> {
    let mut entries: Vec<_> =
        std::fs::read_dir(root.join(rel))?.collect::<std::io::Result<_>>()?;
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
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/data.txt"), "payload").unwrap();
        std::fs::write(src.path().join("manifest.json"), "{}").unwrap();

        let tarball = pack(src.path()).unwrap();

        let dst = tempfile::tempdir().unwrap();
        unpack(&tarball, dst.path()).unwrap();
        assert_eq!(
            std::fs::read_to_string(dst.path().join("sub/data.txt")).unwrap(),
            "payload"
        );
        assert!(dst.path().join("manifest.json").exists());
    }

    #[test]
    fn pack_honors_ignore_file() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("keep.txt"), "yes").unwrap();
        std::fs::write(src.path().join("drop.log"), "no").unwrap();
        std::fs::write(src.path().join(IGNORE_FILE), "*.log\n").unwrap();

        let tarball = pack(src.path()).unwrap();
        let dst = tempfile::tempdir().unwrap();
        unpack(&tarball, dst.path()).unwrap();
        assert!(dst.path().join("keep.txt").exists());
        assert!(!dst.path().join("drop.log").exists());
    }

    #[test]
    fn unpack_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(safe_join(dir.path(), Path::new("../evil")).is_err());
        assert!(safe_join(dir.path(), Path::new("/abs")).is_err());
        assert!(safe_join(dir.path(), Path::new("ok/file")).is_ok());
    }
}
