//! Decode-ahead requests layered over the frame cache.
//!
//! At most one task per media item is queued or running: enqueueing a new
//! one cancels the old through its [`CancelToken`]. Tasks are served by
//! descending priority, FIFO among equal priorities.

use crate::cancel::{CancelSource, CancelToken};
use crate::clip::SourceRef;
use crate::decode_pool::{DecodeRequest, DecodeWorkerPool};
use crate::frame_cache::{CacheKey, FrameCache};
use parking_lot::Mutex;
use proedit_core::{FrameRate, ProEditError};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// A range of source frames to decode ahead of need.
#[derive(Debug, Clone)]
pub struct PreloadTask {
    /// Cache owner of the results.
    pub media_id: Uuid,
    /// Clip whose worker resources do the decoding.
    pub clip_id: Uuid,
    pub source: SourceRef,
    /// Source times to decode, in order.
    pub timestamps: Vec<f64>,
    pub priority: i32,
    token: Option<CancelToken>,
}

impl PreloadTask {
    pub fn new(clip_id: Uuid, source: SourceRef, timestamps: Vec<f64>, priority: i32) -> Self {
        Self {
            media_id: source.media_id,
            clip_id,
            source,
            timestamps,
            priority,
            token: None,
        }
    }

    /// Token assigned when the task was enqueued.
    pub fn token(&self) -> Option<&CancelToken> {
        self.token.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

struct Scheduled {
    task: PreloadTask,
    seq: u64,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Max-heap: higher priority first, then lower sequence number
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue of preload tasks, one per media item.
#[derive(Default)]
pub struct PreloadQueue {
    heap: BinaryHeap<Scheduled>,
    sources: HashMap<Uuid, CancelSource>,
    seq: u64,
}

impl PreloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a task, cancelling any queued or running task for the same
    /// media. Returns the new task's token.
    pub fn enqueue(&mut self, mut task: PreloadTask) -> CancelToken {
        let media = task.media_id;
        let source = self.sources.entry(media).or_default();
        source.cancel();
        let token = source.token();
        self.heap.retain(|s| s.task.media_id != media);

        task.token = Some(token.clone());
        self.seq += 1;
        trace!(
            media = %media,
            priority = task.priority,
            frames = task.timestamps.len(),
            "Preload queued"
        );
        self.heap.push(Scheduled {
            task,
            seq: self.seq,
        });
        token
    }

    /// Highest-priority live task.
    pub fn next(&mut self) -> Option<PreloadTask> {
        while let Some(scheduled) = self.heap.pop() {
            if !scheduled.task.is_cancelled() {
                return Some(scheduled.task);
            }
        }
        None
    }

    /// Cancel the queued or running task for `media`.
    pub fn cancel(&mut self, media: Uuid) -> bool {
        let Some(source) = self.sources.remove(&media) else {
            return false;
        };
        source.cancel();
        self.heap.retain(|s| s.task.media_id != media);
        true
    }

    pub fn cancel_all(&mut self) {
        for source in self.sources.values() {
            source.cancel();
        }
        self.sources.clear();
        self.heap.clear();
    }

    /// Tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.heap.len()
    }
}

/// Where preloaded frames go and at what size.
#[derive(Clone)]
pub struct PreloadTarget {
    pub pool: Arc<DecodeWorkerPool>,
    pub cache: Arc<FrameCache>,
    pub rate: FrameRate,
    pub width: u32,
    pub height: u32,
    pub decode_timeout: Duration,
}

/// Background task draining a [`PreloadQueue`] one task at a time.
pub struct Preloader {
    queue: Arc<Mutex<PreloadQueue>>,
    wake: Arc<Notify>,
    loaded: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl Preloader {
    /// Start the background task on the current tokio runtime.
    pub fn spawn(target: PreloadTarget) -> Self {
        let queue = Arc::new(Mutex::new(PreloadQueue::new()));
        let wake = Arc::new(Notify::new());
        let loaded = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(run_preloader(
            target,
            Arc::clone(&queue),
            Arc::clone(&wake),
            Arc::clone(&loaded),
        ));
        Self {
            queue,
            wake,
            loaded,
            task: Some(task),
        }
    }

    pub fn enqueue(&self, task: PreloadTask) -> CancelToken {
        let token = self.queue.lock().enqueue(task);
        self.wake.notify_one();
        token
    }

    pub fn cancel(&self, media: Uuid) -> bool {
        self.queue.lock().cancel(media)
    }

    pub fn cancel_all(&self) {
        self.queue.lock().cancel_all();
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().pending()
    }

    /// Frames decoded into the cache so far.
    pub fn loaded(&self) -> u64 {
        self.loaded.load(Ordering::Relaxed)
    }

    pub fn shutdown(&mut self) {
        self.cancel_all();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Preloader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_preloader(
    target: PreloadTarget,
    queue: Arc<Mutex<PreloadQueue>>,
    wake: Arc<Notify>,
    loaded: Arc<AtomicU64>,
) {
    loop {
        let next = queue.lock().next();
        match next {
            Some(task) => {
                if !preload_task(&target, &task, &loaded).await {
                    break;
                }
            }
            None => wake.notified().await,
        }
    }
    debug!("Preloader stopped");
}

/// Returns `false` once the pool is gone.
async fn preload_task(target: &PreloadTarget, task: &PreloadTask, loaded: &AtomicU64) -> bool {
    let mut decoded = 0usize;
    for &time in &task.timestamps {
        if task.is_cancelled() {
            debug!(media = %task.media_id, decoded, "Preload superseded");
            return true;
        }
        let key = CacheKey::at(task.media_id, time, target.rate);
        if target.cache.has(&key) {
            continue;
        }
        let mut request = DecodeRequest::new(
            task.clip_id,
            task.source.clone(),
            time,
            target.width,
            target.height,
        );
        if let Some(token) = task.token() {
            request = request.with_token(token.clone());
        }
        match target.pool.decode_frame_timeout(request, target.decode_timeout).await {
            Ok(image) => {
                if task.is_cancelled() {
                    return true;
                }
                if target.cache.set(key, image) {
                    decoded += 1;
                    loaded.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(ProEditError::Disposed) => return false,
            Err(ProEditError::Cancelled) => {
                debug!(media = %task.media_id, decoded, "Preload superseded");
                return true;
            }
            Err(e) => warn!(media = %task.media_id, time, error = %e, "Preload frame failed"),
        }
    }
    debug!(media = %task.media_id, decoded, "Preload finished");
    true
}
