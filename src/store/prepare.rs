//! The prepare pool: eagerly allocated open segments.
//!
//! The store keeps up to two open segments fully allocated and zero-filled
//! so that an append never pays allocation latency. The pool is drained by
//! the append path and refilled by a background creator which runs at most
//! one allocation at a time. Requests that arrive while the pool is empty
//! queue and are satisfied FIFO as allocations complete. Closing the pool
//! cancels pending requests and unlinks unused segments; an allocation
//! failure marks the pool errored and refuses further use.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::StorageError;
use crate::store::meta::sync_dir;
use crate::store::segment::open_filename;

/// Number of open segments we try to keep ready for writing.
const TARGET_POOL_SIZE: usize = 2;

/// A zeroed, preallocated open segment ready to accept log writes.
#[derive(Debug)]
pub(crate) struct PreparedSegment {
    pub counter: u64,
    pub path: PathBuf,
    pub file: fs::File,
}

pub(crate) struct PreparePool {
    shared: Arc<Shared>,
}

struct Shared {
    dir: PathBuf,
    segment_size: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    pool: VecDeque<PreparedSegment>,
    pending: VecDeque<oneshot::Sender<Result<PreparedSegment, StorageError>>>,
    inflight: bool,
    closing: bool,
    errored: bool,
    next_counter: u64,
}

impl PreparePool {
    pub(crate) fn new(dir: PathBuf, segment_size: u64, next_counter: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                dir,
                segment_size,
                inner: Mutex::new(Inner {
                    pool: VecDeque::new(),
                    pending: VecDeque::new(),
                    inflight: false,
                    closing: false,
                    errored: false,
                    next_counter,
                }),
            }),
        }
    }

    /// Start filling the pool without taking a segment.
    pub(crate) fn prewarm(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        maybe_prepare_segment(&self.shared, &mut inner);
    }

    /// Get a prepared open segment.
    ///
    /// Completes immediately when the pool has one; otherwise the request
    /// queues until the next allocation finishes.
    pub(crate) async fn acquire(&self) -> Result<PreparedSegment, StorageError> {
        let rx = {
            let mut inner = self.shared.inner.lock().unwrap();
            if inner.closing {
                return Err(StorageError::shutdown());
            }
            if inner.errored {
                return Err(StorageError::io(anyhow::anyhow!("prepare pool is errored")));
            }
            if let Some(segment) = inner.pool.pop_front() {
                maybe_prepare_segment(&self.shared, &mut inner);
                return Ok(segment);
            }
            let (tx, rx) = oneshot::channel();
            inner.pending.push_back(tx);
            maybe_prepare_segment(&self.shared, &mut inner);
            rx
        };
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(StorageError::canceled()),
        }
    }

    /// Cancel pending requests and unlink unused prepared segments. An
    /// allocation still in flight is discarded when it completes.
    pub(crate) fn close(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.closing = true;
        for tx in inner.pending.drain(..) {
            let _ = tx.send(Err(StorageError::canceled()));
        }
        for segment in inner.pool.drain(..) {
            drop(segment.file);
            let _ = fs::remove_file(&segment.path);
        }
    }

    /// `(ready, inflight)`, for invariant checks in tests.
    #[cfg(test)]
    pub(crate) fn stats(&self) -> (usize, usize) {
        let inner = self.shared.inner.lock().unwrap();
        (inner.pool.len(), usize::from(inner.inflight))
    }
}

/// If the pool is under target and no allocation is running, start one.
fn maybe_prepare_segment(shared: &Arc<Shared>, inner: &mut Inner) {
    if inner.inflight || inner.closing || inner.errored {
        return;
    }
    if inner.pool.len() >= TARGET_POOL_SIZE && inner.pending.is_empty() {
        return;
    }

    inner.inflight = true;
    let counter = inner.next_counter;
    inner.next_counter += 1;

    let shared = shared.clone();
    tokio::spawn(async move {
        let dir = shared.dir.clone();
        let size = shared.segment_size;
        let res = tokio::task::spawn_blocking(move || allocate_segment(&dir, counter, size)).await;
        let res = match res {
            Ok(res) => res,
            Err(e) => Err(StorageError::io(anyhow::anyhow!("allocation task panicked: {e}"))),
        };

        let mut inner = shared.inner.lock().unwrap();
        inner.inflight = false;
        match res {
            Ok(segment) => {
                if inner.closing {
                    tracing::debug!(counter, "discarding segment prepared during close");
                    let path = segment.path.clone();
                    drop(segment);
                    let _ = fs::remove_file(&path);
                    return;
                }
                tracing::debug!(counter, "completed creation of open segment");
                inner.pool.push_back(segment);
                // Satisfy pending requests FIFO.
                while !inner.pending.is_empty() && !inner.pool.is_empty() {
                    let tx = inner.pending.pop_front().unwrap();
                    let segment = inner.pool.pop_front().unwrap();
                    if let Err(Ok(segment)) = tx.send(Ok(segment)) {
                        // Requester went away; keep the segment.
                        inner.pool.push_front(segment);
                        break;
                    }
                }
                maybe_prepare_segment(&shared, &mut inner);
            }
            Err(err) => {
                tracing::error!(error = %err, counter, "segment allocation failed, erroring the store");
                inner.errored = true;
                let msg = err.to_string();
                for tx in inner.pending.drain(..) {
                    let _ = tx.send(Err(StorageError::io(anyhow::anyhow!(msg.clone()))));
                }
            }
        }
    });
}

/// Allocate a zero-filled open segment and make it durable: write zeros to
/// the full segment size, fsync the file, fsync the directory.
fn allocate_segment(dir: &Path, counter: u64, size: u64) -> Result<PreparedSegment, StorageError> {
    let path = dir.join(open_filename(counter));
    let mut file = fs::File::create(&path)?;
    let zeros = vec![0u8; 64 * 1024];
    let mut remaining = size;
    while remaining > 0 {
        let n = remaining.min(zeros.len() as u64) as usize;
        file.write_all(&zeros[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()?;
    sync_dir(dir)?;
    Ok(PreparedSegment { counter, path, file })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::time::sleep;
    use tokio::time::Duration;

    const SEGMENT_SIZE: u64 = 16 * 1024;

    async fn quiesce(pool: &PreparePool) {
        for _ in 0..100 {
            let (ready, inflight) = pool.stats();
            if ready >= TARGET_POOL_SIZE && inflight == 0 {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_pool_bound_holds() {
        let dir = TempDir::new().unwrap();
        let pool = PreparePool::new(dir.path().to_path_buf(), SEGMENT_SIZE, 1);
        pool.prewarm();
        quiesce(&pool).await;

        let (ready, inflight) = pool.stats();
        assert_eq!(ready, TARGET_POOL_SIZE);
        assert_eq!(inflight, 0);

        // At any observed moment: ready <= 2 and inflight <= 1.
        for _ in 0..5 {
            let seg = pool.acquire().await.unwrap();
            let (ready, inflight) = pool.stats();
            assert!(ready <= TARGET_POOL_SIZE);
            assert!(inflight <= 1);
            drop(seg);
        }
    }

    #[tokio::test]
    async fn test_segments_are_zeroed_and_counters_increase() {
        let dir = TempDir::new().unwrap();
        let pool = PreparePool::new(dir.path().to_path_buf(), SEGMENT_SIZE, 7);
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert!(b.counter > a.counter);
        assert_eq!(a.counter, 7);

        let buf = fs::read(&a.path).unwrap();
        assert_eq!(buf.len() as u64, SEGMENT_SIZE);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_close_unlinks_unused_segments() {
        let dir = TempDir::new().unwrap();
        let pool = PreparePool::new(dir.path().to_path_buf(), SEGMENT_SIZE, 1);
        pool.prewarm();
        quiesce(&pool).await;
        pool.close();

        // Give a potentially inflight allocation a moment to discard itself.
        sleep(Duration::from_millis(50)).await;
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("open-"))
            .collect();
        assert!(leftovers.is_empty());

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), crate::StorageErrorKind::Shutdown);
    }

    #[tokio::test]
    async fn test_allocation_failure_errors_the_pool() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("missing");
        let pool = PreparePool::new(gone, SEGMENT_SIZE, 1);
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), crate::StorageErrorKind::Io);

        // The pool stays errored.
        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), crate::StorageErrorKind::Io);
    }
}
