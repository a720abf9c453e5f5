//! Directory-backed queue: one file per message, named by a zero-padded
//! sequence number. A message file is a single JSON header line followed by
//! the raw body bytes. Files appear atomically (write-temp + rename), so a
//! crash never leaves a half-visible message.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use sp_domain::{Body, CapturedRequest, Error, Result};

use crate::Queue;

/// Poll fallback for files placed by other processes; same-process puts
/// wake the consumer immediately through the notifier.
const WAIT_POLL: std::time::Duration = std::time::Duration::from_millis(250);

const SEQ_WIDTH: usize = 20;

pub struct DirQueue {
    dir: PathBuf,
    state: Mutex<DirState>,
    notify: Notify,
    tmp_counter: AtomicU64,
}

struct DirState {
    pending: BTreeSet<u64>,
    next_seq: u64,
}

impl DirQueue {
    /// Open (or create) the queue directory and index existing messages.
    pub fn open(dir: impl Into<PathBuf>) -> Result<DirQueue> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let mut pending = BTreeSet::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(seq) = parse_seq(&entry.file_name()) {
                pending.insert(seq);
            }
        }
        let next_seq = pending.iter().next_back().map(|s| s + 1).unwrap_or(0);
        Ok(DirQueue {
            dir,
            state: Mutex::new(DirState { pending, next_seq }),
            notify: Notify::new(),
            tmp_counter: AtomicU64::new(0),
        })
    }

    fn message_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:0width$}", width = SEQ_WIDTH))
    }

    fn head(&self) -> Option<u64> {
        self.state.lock().pending.iter().next().copied()
    }
}

fn parse_seq(name: &std::ffi::OsStr) -> Option<u64> {
    let name = name.to_str()?;
    if name.len() != SEQ_WIDTH || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

#[async_trait]
impl Queue for DirQueue {
    async fn put(&self, mut request: CapturedRequest) -> Result<()> {
        // materialize the message in a hidden temp file first
        let tmp = self.dir.join(format!(
            ".inflight-{}-{}",
            std::process::id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        let body = request.take_body();
        let header = serde_json::to_vec(&request)?;
        let write = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&header).await?;
            file.write_all(b"\n").await?;
            let mut reader = body.into_reader();
            tokio::io::copy(&mut reader, &mut file).await?;
            file.sync_all().await?;
            Ok::<_, Error>(())
        };
        if let Err(e) = write.await {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }

        // sequence assignment and rename happen under the lock so the
        // consumer never observes a numbered file that is still being
        // written
        let mut state = self.state.lock();
        let seq = state.next_seq;
        if let Err(e) = std::fs::rename(&tmp, self.message_path(seq)) {
            drop(state);
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        state.next_seq += 1;
        state.pending.insert(seq);
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn peek(&self, cancel: &CancellationToken) -> Result<CapturedRequest> {
        loop {
            if cancel.is_cancelled() {
                return Err(Error::RuntimeFailure("queue peek canceled".into()));
            }
            if let Some(seq) = self.head() {
                let path = self.message_path(seq);
                match open_message(&path).await {
                    Ok(request) => return Ok(request),
                    Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        // lost to a crash between index and disk; skip it
                        tracing::warn!(seq, path = %path.display(), "queued message vanished");
                        self.state.lock().pending.remove(&seq);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(WAIT_POLL) => {}
                _ = cancel.cancelled() => {
                    return Err(Error::RuntimeFailure("queue peek canceled".into()));
                }
            }
        }
    }

    async fn commit(&self) -> Result<()> {
        let head = self.head();
        let Some(seq) = head else {
            return Ok(()); // nothing peeked, nothing to drop
        };
        tokio::fs::remove_file(self.message_path(seq)).await?;
        self.state.lock().pending.remove(&seq);
        Ok(())
    }

    fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    async fn destroy(&self) -> Result<()> {
        tokio::fs::remove_dir_all(&self.dir).await?;
        Ok(())
    }
}

async fn open_message(path: &Path) -> Result<CapturedRequest> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut header = String::new();
    reader.read_line(&mut header).await?;
    let request: CapturedRequest = serde_json::from_str(header.trim_end())?;
    // the remainder of the file is the body
    Ok(request.with_body(Body::new(reader)))
}
