//! Queue manager: named durable FIFOs, each drained by a single worker
//! task that delivers messages to the queue's target lambda with bounded
//! retries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sp_domain::config::{atomic_write_json, valid_queue_name};
use sp_domain::{CapturedRequest, Error, QueueDescriptor, Record, Result};
use sp_queue::{DirQueue, MemoryQueue, Queue};

use crate::platform::Registry;
use crate::policy;
use crate::stats;

/// Pause after a failed commit before trying the message again.
const COMMIT_FAILED_BACKOFF: Duration = Duration::from_secs(3);

/// How a new queue's storage is materialized.
#[derive(Debug, Clone)]
pub enum BackendKind {
    /// Directory per queue under the given root.
    Directory(PathBuf),
    /// Bounded in-memory channel of the given depth.
    Memory(usize),
}

impl BackendKind {
    fn build(&self, name: &str) -> Result<Arc<dyn Queue>> {
        match self {
            BackendKind::Directory(root) => Ok(Arc::new(DirQueue::open(root.join(name))?)),
            BackendKind::Memory(depth) => Ok(Arc::new(MemoryQueue::new(*depth))),
        }
    }
}

/// Delivers one message to a lambda; implemented on top of the registry so
/// the worker loop stays testable.
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    async fn deliver(
        &self,
        cancel: &CancellationToken,
        uid: &str,
        request: CapturedRequest,
    ) -> Result<()>;
}

/// Production delivery: resolve the target, run the policy check, invoke
/// with a discarded output and record the outcome.
pub struct PlatformDelivery {
    pub registry: Arc<Registry>,
    pub policies: Arc<policy::Engine>,
    pub stats: Arc<stats::Recorder>,
}

#[async_trait]
impl Delivery for PlatformDelivery {
    async fn deliver(
        &self,
        cancel: &CancellationToken,
        uid: &str,
        request: CapturedRequest,
    ) -> Result<()> {
        let record = Record::begin(uid, request.clone());
        let result = async {
            let def = self.registry.find_by_uid(uid)?;
            self.policies.inspect(uid, &request)?;
            let mut sink = tokio::io::sink();
            def.lambda
                .invoke(cancel, request, &mut sink, &self.registry.global_env())
                .await
        }
        .await;
        self.stats
            .track(record.finish(result.as_ref().err().map(|e| e.to_string())));
        result
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    queues: Vec<QueueDescriptor>,
}

struct WorkerHandle {
    cancel: CancellationToken,
    done: JoinHandle<()>,
}

struct QueueEntry {
    descriptor: QueueDescriptor,
    backend: Arc<dyn Queue>,
    worker: WorkerHandle,
}

pub struct Manager {
    store_path: PathBuf,
    backend: BackendKind,
    delivery: Arc<dyn Delivery>,
    /// Enqueue-time policy check (defense in depth; the worker re-checks
    /// on delivery). `None` disables it.
    policies: Option<Arc<policy::Engine>>,
    root_cancel: CancellationToken,
    inner: RwLock<HashMap<String, QueueEntry>>,
}

impl Manager {
    /// Load `queues.json` and start one worker per stored queue.
    pub fn open(
        store_path: impl Into<PathBuf>,
        backend: BackendKind,
        delivery: Arc<dyn Delivery>,
        policies: Option<Arc<policy::Engine>>,
        root_cancel: CancellationToken,
    ) -> Result<Manager> {
        let store_path = store_path.into();
        let stored = match std::fs::read(&store_path) {
            Ok(data) => serde_json::from_slice::<QueueFile>(&data)?.queues,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let manager = Manager {
            store_path,
            backend,
            delivery,
            policies,
            root_cancel,
            inner: RwLock::new(HashMap::new()),
        };
        {
            let mut inner = manager.inner.write();
            for descriptor in stored {
                let entry = manager.start_queue(descriptor)?;
                inner.insert(entry.descriptor.name.clone(), entry);
            }
        }
        Ok(manager)
    }

    /// Enqueue a request. The target's policy applies at enqueue time as
    /// well, and the length cap (when positive) rejects overflow.
    pub async fn put(&self, name: &str, request: CapturedRequest) -> Result<()> {
        let (backend, descriptor) = {
            let inner = self.inner.read();
            let entry = inner
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("queue {name} does not exist")))?;
            (entry.backend.clone(), entry.descriptor.clone())
        };
        if let Some(policies) = &self.policies {
            policies.inspect(&descriptor.target, &request)?;
        }
        if descriptor.max_element_size > 0 && backend.len() as i64 > descriptor.max_element_size {
            return Err(Error::PayloadTooLarge(format!(
                "queue {name} is over its element cap"
            )));
        }
        backend.put(request).await
    }

    pub fn add(&self, descriptor: QueueDescriptor) -> Result<()> {
        if !valid_queue_name(&descriptor.name) {
            return Err(Error::Validation(format!(
                "invalid queue name {:?}: expected [A-Za-z0-9-]{{3,64}}",
                descriptor.name
            )));
        }
        let mut inner = self.inner.write();
        if inner.contains_key(&descriptor.name) {
            return Err(Error::Conflict(format!(
                "queue {} already exists",
                descriptor.name
            )));
        }
        let entry = self.start_queue(descriptor)?;
        inner.insert(entry.descriptor.name.clone(), entry);
        self.persist(&inner)
    }

    /// Stop the worker, wait for it, destroy the storage and forget the
    /// queue. Removing an unknown queue is a no-op.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let entry = { self.inner.write().remove(name) };
        let Some(entry) = entry else {
            return Ok(());
        };
        stop_worker(entry.worker).await;
        entry.backend.destroy().await?;
        let inner = self.inner.read();
        self.persist(&inner)
    }

    /// Re-point the queue at another lambda: the worker is stopped and
    /// restarted with the new target; an uncommitted in-flight message is
    /// re-delivered to the new target.
    pub async fn assign(&self, name: &str, target: &str) -> Result<()> {
        // park the queue first: the old worker must fully stop before the
        // new target's worker may observe the in-flight message
        let old = {
            let mut inner = self.inner.write();
            let entry = inner
                .get_mut(name)
                .ok_or_else(|| Error::NotFound(format!("queue {name} does not exist")))?;
            entry.descriptor.target = target.to_string();
            let idle = self.spawn_idle_worker();
            std::mem::replace(&mut entry.worker, idle)
        };
        stop_worker(old).await;
        {
            let mut inner = self.inner.write();
            if let Some(entry) = inner.get_mut(name) {
                let fresh = self.spawn_worker(entry.descriptor.clone(), entry.backend.clone());
                let idle = std::mem::replace(&mut entry.worker, fresh);
                idle.cancel.cancel();
            }
        }
        let inner = self.inner.read();
        self.persist(&inner)
    }

    pub fn list(&self) -> Vec<QueueDescriptor> {
        let inner = self.inner.read();
        let mut list: Vec<QueueDescriptor> =
            inner.values().map(|e| e.descriptor.clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Queues bound to the given lambda UID.
    pub fn find(&self, target: &str) -> Vec<QueueDescriptor> {
        let mut list: Vec<QueueDescriptor> = self
            .inner
            .read()
            .values()
            .filter(|e| e.descriptor.target == target)
            .map(|e| e.descriptor.clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn len(&self, name: &str) -> Result<usize> {
        let inner = self.inner.read();
        inner
            .get(name)
            .map(|e| e.backend.len())
            .ok_or_else(|| Error::NotFound(format!("queue {name} does not exist")))
    }

    /// Wait for every worker to observe cancellation and finish its current
    /// attempt loop. Call after cancelling the root token.
    pub async fn shutdown(&self) {
        let workers: Vec<WorkerHandle> = {
            let mut inner = self.inner.write();
            inner
                .values_mut()
                .map(|entry| {
                    let idle = self.spawn_idle_worker();
                    std::mem::replace(&mut entry.worker, idle)
                })
                .collect()
        };
        for worker in workers {
            stop_worker(worker).await;
        }
    }

    fn start_queue(&self, descriptor: QueueDescriptor) -> Result<QueueEntry> {
        let backend = self.backend.build(&descriptor.name)?;
        let worker = self.spawn_worker(descriptor.clone(), backend.clone());
        Ok(QueueEntry {
            descriptor,
            backend,
            worker,
        })
    }

    fn spawn_worker(&self, descriptor: QueueDescriptor, backend: Arc<dyn Queue>) -> WorkerHandle {
        let cancel = self.root_cancel.child_token();
        let token = cancel.clone();
        let delivery = self.delivery.clone();
        let done = tokio::spawn(async move {
            worker_loop(token, backend, descriptor, delivery).await;
        });
        WorkerHandle { cancel, done }
    }

    fn spawn_idle_worker(&self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        cancel.cancel();
        WorkerHandle {
            cancel,
            done: tokio::spawn(async {}),
        }
    }

    fn persist(&self, inner: &HashMap<String, QueueEntry>) -> Result<()> {
        let mut queues: Vec<QueueDescriptor> =
            inner.values().map(|e| e.descriptor.clone()).collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        atomic_write_json(&self.store_path, &QueueFile { queues })
    }
}

async fn stop_worker(worker: WorkerHandle) {
    worker.cancel.cancel();
    if let Err(e) = worker.done.await {
        if !e.is_cancelled() {
            tracing::error!(error = %e, "queue worker panicked");
        }
    }
}

/// Per-queue consumer: peek → deliver with bounded retries → commit.
/// Delivery is at-least-once; a message is dropped (committed) after the
/// retry budget is exhausted.
async fn worker_loop(
    cancel: CancellationToken,
    backend: Arc<dyn Queue>,
    descriptor: QueueDescriptor,
    delivery: Arc<dyn Delivery>,
) {
    let interval = descriptor.interval.as_duration();
    loop {
        let mut attempt: u64 = 0;
        let attempts = descriptor.attempts();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match backend.peek(&cancel).await {
                Ok(request) => {
                    match delivery
                        .deliver(&cancel, &descriptor.target, request)
                        .await
                    {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::warn!(
                                queue = %descriptor.name,
                                target = %descriptor.target,
                                attempt,
                                error = %e,
                                "delivery failed"
                            );
                        }
                    }
                }
                Err(e) => {
                    if cancel.is_cancelled() {
                        return;
                    }
                    tracing::warn!(queue = %descriptor.name, error = %e, "queue peek failed");
                }
            }
            attempt += 1;
            if attempt >= attempts {
                tracing::error!(
                    queue = %descriptor.name,
                    target = %descriptor.target,
                    attempts,
                    "dropping message after exhausting retries"
                );
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return,
            }
        }
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = backend.commit().await {
            tracing::error!(queue = %descriptor.name, error = %e, "commit failed, backing off");
            tokio::select! {
                _ = tokio::time::sleep(COMMIT_FAILED_BACKOFF) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    struct MockDelivery {
        delivered: parking_lot::Mutex<Vec<(String, String)>>,
        fail_target: Option<String>,
        attempts: AtomicUsize,
    }

    impl MockDelivery {
        fn new(fail_target: Option<&str>) -> Arc<MockDelivery> {
            Arc::new(MockDelivery {
                delivered: parking_lot::Mutex::new(Vec::new()),
                fail_target: fail_target.map(String::from),
                attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Delivery for MockDelivery {
        async fn deliver(
            &self,
            _cancel: &CancellationToken,
            uid: &str,
            mut request: CapturedRequest,
        ) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_target.as_deref() == Some(uid) {
                return Err(Error::RuntimeFailure("always failing".into()));
            }
            let mut body = Vec::new();
            request
                .take_body()
                .into_reader()
                .read_to_end(&mut body)
                .await
                .unwrap();
            self.delivered
                .lock()
                .push((uid.to_string(), String::from_utf8(body).unwrap()));
            Ok(())
        }
    }

    fn request(body: &str) -> CapturedRequest {
        let mut req = CapturedRequest::default();
        req.method = "POST".into();
        req.remote_address = "127.0.0.2:9992".into();
        req.with_body(sp_domain::Body::new(std::io::Cursor::new(
            body.as_bytes().to_vec(),
        )))
    }

    fn descriptor(name: &str, target: &str) -> QueueDescriptor {
        QueueDescriptor {
            name: name.into(),
            target: target.into(),
            retry: 0,
            max_element_size: 0,
            interval: sp_domain::HumanDuration::from_millis(10),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn manager(dir: &std::path::Path, delivery: Arc<dyn Delivery>) -> Manager {
        Manager::open(
            dir.join("queues.json"),
            BackendKind::Memory(16),
            delivery,
            None,
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn enqueue_is_delivered_to_target() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = MockDelivery::new(None);
        let qm = manager(dir.path(), delivery.clone());
        qm.add(descriptor("queue-1", "echo")).unwrap();

        qm.put("queue-1", request("hello world")).await.unwrap();
        wait_until(|| !delivery.delivered.lock().is_empty()).await;
        assert_eq!(
            delivery.delivered.lock()[0],
            ("echo".to_string(), "hello world".to_string())
        );
        // queue drained after the worker cycle
        wait_until(|| qm.len("queue-1").unwrap() == 0).await;
    }

    #[tokio::test]
    async fn unknown_queue_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let qm = manager(dir.path(), MockDelivery::new(None));
        let err = qm.put("ghost", request("x")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "{err}");
    }

    #[tokio::test]
    async fn retry_then_drop_after_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let delivery = MockDelivery::new(Some("broken"));
        let qm = manager(dir.path(), delivery.clone());
        let mut d = descriptor("retry-q", "broken");
        d.retry = 2;
        qm.add(d).unwrap();

        qm.put("retry-q", request("1+2")).await.unwrap();
        // 1 initial + 2 retries
        wait_until(|| delivery.attempts.load(Ordering::SeqCst) == 3).await;
        wait_until(|| qm.len("retry-q").unwrap() == 0).await;
        // and no extra attempts after the drop
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(delivery.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn queue_name_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let qm = manager(dir.path(), MockDelivery::new(None));
        assert!(qm.add(descriptor("ab", "echo")).is_err());
        assert!(qm.add(descriptor("with.dots", "echo")).is_err());
        qm.add(descriptor("fine-name", "echo")).unwrap();
        let err = qm.add(descriptor("fine-name", "echo")).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "{err}");
    }

    #[tokio::test]
    async fn remove_and_list_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let qm = manager(dir.path(), MockDelivery::new(None));
        qm.add(descriptor("queue-1", "echo")).unwrap();
        qm.add(descriptor("queue-2", "greeter")).unwrap();

        qm.remove("queue-1").await.unwrap();
        let list = qm.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "queue-2");
        assert_eq!(list[0].target, "greeter");

        qm.assign("queue-2", "echo").await.unwrap();
        qm.add(descriptor("queue-3", "echo")).unwrap();
        let found = qm.find("echo");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].name, "queue-2");
        assert_eq!(found[1].name, "queue-3");

        // removing an unknown queue is fine
        qm.remove("queue-1").await.unwrap();
    }

    #[tokio::test]
    async fn descriptors_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        {
            let qm = Manager::open(
                dir.path().join("queues.json"),
                BackendKind::Directory(dir.path().join(".queues")),
                MockDelivery::new(None),
                None,
                cancel.clone(),
            )
            .unwrap();
            qm.add(descriptor("durable-q", "echo")).unwrap();
            cancel.cancel();
            qm.shutdown().await;
        }
        let qm = Manager::open(
            dir.path().join("queues.json"),
            BackendKind::Directory(dir.path().join(".queues")),
            MockDelivery::new(None),
            None,
            CancellationToken::new(),
        )
        .unwrap();
        let list = qm.list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "durable-q");
    }

    #[tokio::test]
    async fn platform_delivery_records_every_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(
            crate::platform::Registry::open(dir.path().join("project.json"), "").unwrap(),
        );
        let policies =
            Arc::new(policy::Engine::open(dir.path().join("policies.json")).unwrap());
        let stats =
            Arc::new(stats::Recorder::open(dir.path().join(".stats"), 64).unwrap());

        // a lambda that always exits non-zero
        let uid = "3e1b0d6e-0000-4000-8000-00000000feed";
        let lambda_dir = dir.path().join(uid);
        std::fs::create_dir_all(&lambda_dir).unwrap();
        let mf = sp_domain::Manifest {
            run: vec!["/bin/sh".into(), "-c".into(), "exit 1".into()],
            public: true,
            ..Default::default()
        };
        mf.save_as(&lambda_dir.join("manifest.json")).unwrap();
        registry
            .add(uid, crate::platform::LocalLambda::from_dir(&lambda_dir).unwrap())
            .unwrap();

        let qm = Manager::open(
            dir.path().join("queues.json"),
            BackendKind::Memory(16),
            Arc::new(PlatformDelivery {
                registry,
                policies,
                stats: stats.clone(),
            }),
            None,
            CancellationToken::new(),
        )
        .unwrap();
        let mut d = descriptor("flaky", uid);
        d.retry = 2;
        qm.add(d).unwrap();

        qm.put("flaky", request("payload")).await.unwrap();
        wait_until(|| qm.len("flaky").unwrap() == 0).await;
        wait_until(|| stats.last_by_uid(uid, 10).len() == 3).await;
        let records = stats.last_by_uid(uid, 10);
        assert!(records.iter().all(|r| r.error.is_some()));
    }

    #[tokio::test]
    async fn length_cap_rejects_overflow() {
        let dir = tempfile::tempdir().unwrap();
        // always-failing delivery keeps messages pending
        let delivery = MockDelivery::new(Some("stuck"));
        let qm = manager(dir.path(), delivery);
        let mut d = descriptor("tiny", "stuck");
        d.retry = -1; // retry forever so nothing is dropped
        d.interval = sp_domain::HumanDuration::from_secs(60);
        d.max_element_size = 1;
        qm.add(d).unwrap();

        qm.put("tiny", request("a")).await.unwrap();
        qm.put("tiny", request("b")).await.unwrap();
        let err = qm.put("tiny", request("c")).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(_)), "{err}");
    }
}
