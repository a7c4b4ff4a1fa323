use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tarlift_core::hash::{Digest, RemoteDigest};
use tarlift_storage::{
    CompletedPart, MemoryStore, MultipartId, ObjectMeta, ObjectStore, PartReceipt, PutOptions,
    StorageError, StorageResult,
};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug)]
enum Fault {
    Transient,
    Permanent,
}

impl Fault {
    fn error(self, what: &str) -> StorageError {
        match self {
            Self::Transient => StorageError::Transient(format!("injected timeout on {what}")),
            Self::Permanent => StorageError::Rejected {
                status: 403,
                message: format!("injected rejection on {what}"),
            },
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    parts: HashMap<u32, (Fault, u32)>,
    put: Option<(Fault, u32)>,
    commit: Option<(Fault, u32)>,
    head: Option<(Fault, u32)>,
    health: Option<(Fault, u32)>,
}

fn take(slot: &mut Option<(Fault, u32)>) -> Option<Fault> {
    match slot {
        Some((fault, remaining)) if *remaining > 0 => {
            *remaining -= 1;
            Some(*fault)
        }
        _ => None,
    }
}

/// Memory store wrapper that injects failures and counts calls.
#[allow(dead_code)]
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    faults: Mutex<Faults>,
    part_attempts: Mutex<HashMap<u32, u32>>,
    pub puts: AtomicUsize,
    pub creates: AtomicUsize,
    pub commits: AtomicUsize,
    pub aborts: AtomicUsize,
    pub heads: AtomicUsize,
    pub health_checks: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    part_delay: Mutex<Option<Duration>>,
    cancel_after_part: Mutex<Option<(u32, CancellationToken)>>,
    head_digest: Mutex<Option<RemoteDigest>>,
}

#[allow(dead_code)]
impl FlakyStore {
    pub fn new() -> Self {
        Self::wrap(Arc::new(MemoryStore::new()))
    }

    /// Wrap an existing store so several runs can share its contents.
    pub fn wrap(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
            part_attempts: Mutex::new(HashMap::new()),
            puts: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            heads: AtomicUsize::new(0),
            health_checks: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            part_delay: Mutex::new(None),
            cancel_after_part: Mutex::new(None),
            head_digest: Mutex::new(None),
        }
    }

    /// Fail the next `times` uploads of `part_number` with a timeout.
    pub fn fail_part_transient(self, part_number: u32, times: u32) -> Self {
        self.faults
            .lock()
            .unwrap()
            .parts
            .insert(part_number, (Fault::Transient, times));
        self
    }

    /// Reject every upload of `part_number` with a 403.
    pub fn fail_part_permanent(self, part_number: u32) -> Self {
        self.faults
            .lock()
            .unwrap()
            .parts
            .insert(part_number, (Fault::Permanent, u32::MAX));
        self
    }

    pub fn fail_put_transient(self, times: u32) -> Self {
        self.faults.lock().unwrap().put = Some((Fault::Transient, times));
        self
    }

    /// Fail the next `times` commits with a permanent error.
    pub fn fail_commit(self, times: u32) -> Self {
        self.faults.lock().unwrap().commit = Some((Fault::Permanent, times));
        self
    }

    pub fn fail_head_transient(self, times: u32) -> Self {
        self.faults.lock().unwrap().head = Some((Fault::Transient, times));
        self
    }

    /// Fail every health check as if the bucket did not answer.
    pub fn fail_health(self) -> Self {
        self.faults.lock().unwrap().health = Some((Fault::Permanent, u32::MAX));
        self
    }

    pub fn fail_health_transient(self, times: u32) -> Self {
        self.faults.lock().unwrap().health = Some((Fault::Transient, times));
        self
    }

    pub fn with_part_delay(self, delay: Duration) -> Self {
        *self.part_delay.lock().unwrap() = Some(delay);
        self
    }

    /// Trigger `token` once `part_number` has been stored.
    pub fn cancel_after_part(self, part_number: u32, token: CancellationToken) -> Self {
        self.arm_cancel(part_number, token);
        self
    }

    /// Same as `cancel_after_part`, for a store already shared.
    pub fn arm_cancel(&self, part_number: u32, token: CancellationToken) {
        *self.cancel_after_part.lock().unwrap() = Some((part_number, token));
    }

    /// Report this digest from `head` instead of the real one.
    pub fn override_head_digest(self, digest: RemoteDigest) -> Self {
        *self.head_digest.lock().unwrap() = Some(digest);
        self
    }

    pub fn part_attempts(&self, part_number: u32) -> u32 {
        self.part_attempts
            .lock()
            .unwrap()
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    /// Distinct part numbers that saw at least one upload attempt.
    pub fn parts_attempted(&self) -> usize {
        self.part_attempts.lock().unwrap().len()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        digest: &Digest,
        options: &PutOptions,
    ) -> StorageResult<RemoteDigest> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let fault = take(&mut self.faults.lock().unwrap().put);
        if let Some(fault) = fault {
            return Err(fault.error("put"));
        }
        self.inner.put(key, data, digest, options).await
    }

    async fn create_multipart(
        &self,
        key: &str,
        options: &PutOptions,
    ) -> StorageResult<MultipartId> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_multipart(key, options).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload: &MultipartId,
        part_number: u32,
        data: Bytes,
        digest: &Digest,
    ) -> StorageResult<PartReceipt> {
        *self
            .part_attempts
            .lock()
            .unwrap()
            .entry(part_number)
            .or_insert(0) += 1;

        let fault = {
            let mut faults = self.faults.lock().unwrap();
            let mut slot = faults.parts.get(&part_number).copied();
            let fault = take(&mut slot);
            match slot {
                Some(slot) => faults.parts.insert(part_number, slot),
                None => faults.parts.remove(&part_number),
            };
            fault
        };
        if let Some(fault) = fault {
            return Err(fault.error(&format!("part {part_number}")));
        }

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let delay = *self.part_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let result = self
            .inner
            .upload_part(key, upload, part_number, data, digest)
            .await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let cancel = self.cancel_after_part.lock().unwrap().clone();
        if let Some((after, token)) = cancel
            && after == part_number
        {
            token.cancel();
        }
        result
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload: &MultipartId,
        parts: &[CompletedPart],
    ) -> StorageResult<RemoteDigest> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let fault = take(&mut self.faults.lock().unwrap().commit);
        if let Some(fault) = fault {
            return Err(fault.error("commit"));
        }
        self.inner.complete_multipart(key, upload, parts).await
    }

    async fn abort_multipart(&self, key: &str, upload: &MultipartId) -> StorageResult<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.inner.abort_multipart(key, upload).await
    }

    async fn list_parts(
        &self,
        key: &str,
        upload: &MultipartId,
    ) -> StorageResult<Vec<CompletedPart>> {
        self.inner.list_parts(key, upload).await
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        self.heads.fetch_add(1, Ordering::SeqCst);
        let fault = take(&mut self.faults.lock().unwrap().head);
        if let Some(fault) = fault {
            return Err(fault.error("head"));
        }
        let mut meta = self.inner.head(key).await?;
        if let Some(digest) = self.head_digest.lock().unwrap().clone() {
            meta.digest = digest;
        }
        Ok(meta)
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        let fault = take(&mut self.faults.lock().unwrap().health);
        match fault {
            Some(fault) => Err(fault.error("health check")),
            None => self.inner.health_check().await,
        }
    }

    fn backend_name(&self) -> &'static str {
        "flaky-memory"
    }

    fn target_id(&self, key: &str) -> String {
        self.inner.target_id(key)
    }
}
