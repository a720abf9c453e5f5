//! Bounded in-memory queue: a channel of buffered messages with a
//! single-slot peek. Nothing survives a restart; useful for development
//! and tests.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use sp_domain::{Body, CapturedRequest, Error, Result};

use crate::Queue;

struct Item {
    header: CapturedRequest,
    data: Vec<u8>,
}

impl Item {
    fn to_request(&self) -> CapturedRequest {
        self.header
            .clone()
            .with_body(Body::new(Cursor::new(self.data.clone())))
    }
}

pub struct MemoryQueue {
    tx: mpsc::Sender<Item>,
    rx: Mutex<mpsc::Receiver<Item>>,
    /// Message peeked but not yet committed.
    peeked: Mutex<Option<Item>>,
    pending: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new(depth: usize) -> MemoryQueue {
        let (tx, rx) = mpsc::channel(depth.max(1));
        MemoryQueue {
            tx,
            rx: Mutex::new(rx),
            peeked: Mutex::new(None),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::RuntimeFailure("queue is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn put(&self, mut request: CapturedRequest) -> Result<()> {
        self.ensure_open()?;
        let mut data = Vec::new();
        request
            .take_body()
            .into_reader()
            .read_to_end(&mut data)
            .await?;
        self.tx
            .send(Item {
                header: request,
                data,
            })
            .await
            .map_err(|_| Error::RuntimeFailure("queue is closed".into()))?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn peek(&self, cancel: &CancellationToken) -> Result<CapturedRequest> {
        self.ensure_open()?;
        let mut peeked = self.peeked.lock().await;
        if let Some(item) = peeked.as_ref() {
            return Ok(item.to_request());
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            received = rx.recv() => {
                let item = received
                    .ok_or_else(|| Error::RuntimeFailure("queue is closed".into()))?;
                let request = item.to_request();
                *peeked = Some(item);
                Ok(request)
            }
            _ = cancel.cancelled() => {
                Err(Error::RuntimeFailure("queue peek canceled".into()))
            }
        }
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        if self.peeked.lock().await.take().is_some() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    async fn destroy(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.rx.lock().await.close();
        Ok(())
    }
}
