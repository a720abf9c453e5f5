//! Request stats: fixed-depth in-memory ring of outcome records with a
//! periodic on-disk dump.
//!
//! The dump file is a magic header, a record count, then length-prefixed
//! JSON records oldest-first. Files without the magic are treated as the
//! legacy format (a plain JSON array) and converted on read.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::PathBuf;

use parking_lot::RwLock;

use sp_domain::{Error, Record, Result};

const MAGIC: &[u8; 8] = b"SPSTATS\x01";
pub const DEFAULT_DEPTH: usize = 8192;

pub struct Recorder {
    file: PathBuf,
    depth: usize,
    ring: RwLock<VecDeque<Record>>,
}

impl Recorder {
    /// Open the recorder, loading a previous dump when present. An
    /// unreadable dump is fatal; a missing one is not.
    pub fn open(file: impl Into<PathBuf>, depth: usize) -> Result<Recorder> {
        let file = file.into();
        let depth = depth.max(1);
        let mut ring = VecDeque::new();
        match std::fs::read(&file) {
            Ok(data) => {
                for record in decode(&data)? {
                    push_bounded(&mut ring, record, depth);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Recorder {
            file,
            depth,
            ring: RwLock::new(ring),
        })
    }

    pub fn track(&self, record: Record) {
        let mut ring = self.ring.write();
        push_bounded(&mut ring, record, self.depth);
    }

    /// Newest-first global records.
    pub fn last(&self, limit: usize) -> Vec<Record> {
        self.ring.read().iter().rev().take(limit).cloned().collect()
    }

    /// Newest-first records for one lambda.
    pub fn last_by_uid(&self, uid: &str, limit: usize) -> Vec<Record> {
        self.ring
            .read()
            .iter()
            .rev()
            .filter(|r| r.uid == uid)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Atomic dump (write-temp + rename) of the whole ring, oldest first.
    pub fn dump(&self) -> Result<()> {
        let snapshot: Vec<Record> = self.ring.read().iter().cloned().collect();
        let dir = self
            .file
            .parent()
            .ok_or_else(|| Error::Validation(format!("{} has no parent", self.file.display())))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        encode(tmp.as_file_mut(), &snapshot)?;
        tmp.persist(&self.file).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

fn push_bounded(ring: &mut VecDeque<Record>, record: Record, depth: usize) {
    ring.push_back(record);
    while ring.len() > depth {
        ring.pop_front();
    }
}

fn encode(out: &mut impl Write, records: &[Record]) -> Result<()> {
    out.write_all(MAGIC)?;
    out.write_all(&(records.len() as u32).to_le_bytes())?;
    for record in records {
        let data = serde_json::to_vec(record)?;
        out.write_all(&(data.len() as u32).to_le_bytes())?;
        out.write_all(&data)?;
    }
    Ok(())
}

fn decode(data: &[u8]) -> Result<Vec<Record>> {
    if data.len() < MAGIC.len() || &data[..MAGIC.len()] != MAGIC {
        // legacy dump: a bare JSON array of records
        let records: Vec<Record> = serde_json::from_slice(data)
            .map_err(|e| Error::Corruption(format!("unreadable stats dump: {e}")))?;
        return Ok(records);
    }
    let mut cursor = &data[MAGIC.len()..];
    let count = read_u32(&mut cursor)? as usize;
    let mut records = Vec::with_capacity(count.min(DEFAULT_DEPTH));
    for _ in 0..count {
        let len = read_u32(&mut cursor)? as usize;
        if cursor.len() < len {
            return Err(Error::Corruption("truncated stats dump".into()));
        }
        let (head, rest) = cursor.split_at(len);
        records.push(serde_json::from_slice(head)?);
        cursor = rest;
    }
    Ok(records)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| Error::Corruption("truncated stats dump".into()))?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_domain::CapturedRequest;

    fn record(uid: &str, error: Option<&str>) -> Record {
        Record::begin(uid, CapturedRequest::default()).finish(error.map(String::from))
    }

    #[test]
    fn newest_first_queries() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Recorder::open(dir.path().join(".stats"), 16).unwrap();
        rec.track(record("a", None));
        rec.track(record("b", Some("boom")));
        rec.track(record("a", None));

        let all = rec.last(10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].uid, "a");
        assert_eq!(all[1].uid, "b");

        let only_b = rec.last_by_uid("b", 10);
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].error.as_deref(), Some("boom"));
    }

    #[test]
    fn ring_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let rec = Recorder::open(dir.path().join(".stats"), 4).unwrap();
        for i in 0..10 {
            rec.track(record(&format!("uid-{i}"), None));
        }
        let all = rec.last(100);
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].uid, "uid-9");
        assert_eq!(all[3].uid, "uid-6");
    }

    #[test]
    fn dump_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".stats");
        {
            let rec = Recorder::open(&path, 16).unwrap();
            rec.track(record("a", None));
            rec.track(record("b", Some("failed")));
            rec.dump().unwrap();
        }
        let rec = Recorder::open(&path, 16).unwrap();
        let all = rec.last(10);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].uid, "b");
        assert_eq!(all[0].error.as_deref(), Some("failed"));
    }

    #[test]
    fn legacy_json_array_is_migrated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".stats");
        let legacy = vec![record("old", None)];
        std::fs::write(&path, serde_json::to_vec(&legacy).unwrap()).unwrap();
        let rec = Recorder::open(&path, 16).unwrap();
        assert_eq!(rec.last(10)[0].uid, "old");
    }

    #[test]
    fn garbage_dump_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".stats");
        std::fs::write(&path, b"not a dump at all").unwrap();
        assert!(Recorder::open(&path, 16).is_err());
    }
}
