//! Parallel decode worker pool.
//!
//! Workers are OS threads that own per-clip decoder resources. The pool
//! hands each request to the least-busy live worker, queues it FIFO when
//! every worker is at its in-flight cap, and answers repeated requests for
//! the same frame from a small bitmap cache without a worker round-trip.
//!
//! Results come back as [`WorkerEvent`]s over a tokio channel drained by a
//! single completion task, which resolves the caller's oneshot and feeds
//! freed workers from the queue.

use crate::cancel::CancelToken;
use crate::clip::SourceRef;
use crate::config::PoolConfig;
use crate::decode::FrameDecoder;
use crate::frame_cache::{CacheKey, CacheStats, FrameCache};
use crate::worker::{
    reap_workers, spawn_worker, RequestId, WorkerCommand, WorkerEvent, WorkerHandle,
};
use parking_lot::Mutex;
use proedit_core::{DecodedImage, ProEditError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Weight of the newest sample in the rolling decode time.
const DECODE_TIME_ALPHA: f64 = 0.2;

/// How long disposal waits for worker threads to exit.
const SHUTDOWN_DEADLINE: Duration = Duration::from_millis(500);

/// One frame to decode.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub clip_id: Uuid,
    pub source: SourceRef,
    /// Source media time (seconds).
    pub time: f64,
    pub width: u32,
    pub height: u32,
    /// Once cancelled, the request is dropped wherever it waits and
    /// resolves with [`ProEditError::Cancelled`].
    pub token: Option<CancelToken>,
}

impl DecodeRequest {
    pub fn new(clip_id: Uuid, source: SourceRef, time: f64, width: u32, height: u32) -> Self {
        Self {
            clip_id,
            source,
            time,
            width,
            height,
            token: None,
        }
    }

    pub fn with_token(mut self, token: CancelToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

/// Pool observability counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub workers: usize,
    pub live_workers: usize,
    /// Requests currently held by a worker.
    pub pending: usize,
    /// Requests waiting for a free worker.
    pub queued: usize,
    /// In-flight count per worker, by worker id.
    pub per_worker: Vec<usize>,
    pub completed: u64,
    pub failed: u64,
    /// Requests dropped because their token was cancelled.
    pub cancelled: u64,
    pub avg_decode_ms: f64,
    pub bitmap_cache: CacheStats,
}

type Reply = oneshot::Sender<Result<DecodedImage>>;

struct Job {
    id: RequestId,
    request: DecodeRequest,
    key: CacheKey,
    reply: Reply,
}

struct Pending {
    worker: usize,
    key: CacheKey,
    reply: Reply,
}

struct WorkerSlot {
    handle: WorkerHandle,
    in_flight: usize,
    alive: bool,
}

struct PoolState {
    workers: Vec<WorkerSlot>,
    pending: HashMap<RequestId, Pending>,
    queue: VecDeque<Job>,
    next_id: RequestId,
    completed: u64,
    failed: u64,
    cancelled: u64,
    avg_decode_ms: f64,
    disposed: bool,
}

impl PoolState {
    /// Live worker with the fewest in-flight requests below `cap`.
    fn least_busy(&self, cap: usize) -> Option<usize> {
        self.workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.alive && w.in_flight < cap)
            .min_by_key(|(_, w)| w.in_flight)
            .map(|(i, _)| i)
    }

    fn dispatch(&mut self, job: Job, cap: usize) {
        match self.least_busy(cap) {
            Some(worker) => self.send_to(worker, job),
            None => {
                trace!(id = job.id, queued = self.queue.len() + 1, "All workers busy, queueing");
                self.queue.push_back(job);
            }
        }
    }

    fn send_to(&mut self, worker: usize, job: Job) {
        let Job {
            id,
            request,
            key,
            reply,
        } = job;
        let slot = &mut self.workers[worker];
        if !slot.handle.send(WorkerCommand::Decode { id, request }) {
            slot.alive = false;
            let _ = reply.send(Err(ProEditError::WorkerCrashed(worker)));
            return;
        }
        slot.in_flight += 1;
        self.pending.insert(id, Pending { worker, key, reply });
    }

    fn drain_queue(&mut self, cap: usize) {
        while let Some(worker) = self.least_busy(cap) {
            let Some(job) = self.queue.pop_front() else {
                break;
            };
            if job.request.is_cancelled() {
                self.reject_cancelled(job);
                continue;
            }
            self.send_to(worker, job);
        }
    }

    /// Drop every queued job whose token was cancelled.
    fn purge_cancelled(&mut self) -> usize {
        let (dropped, kept): (VecDeque<Job>, VecDeque<Job>) =
            self.queue.drain(..).partition(|job| job.request.is_cancelled());
        self.queue = kept;
        let count = dropped.len();
        for job in dropped {
            self.reject_cancelled(job);
        }
        count
    }

    fn reject_cancelled(&mut self, job: Job) {
        trace!(id = job.id, "Dropping cancelled request");
        self.cancelled += 1;
        let _ = job.reply.send(Err(ProEditError::Cancelled));
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    bitmap_cache: FrameCache,
    config: PoolConfig,
    decoder: Arc<dyn FrameDecoder>,
}

impl PoolShared {
    fn complete(
        &self,
        worker: usize,
        id: RequestId,
        result: Result<DecodedImage>,
        elapsed: Duration,
    ) {
        let pending = {
            let mut state = self.state.lock();
            let Some(pending) = state.pending.remove(&id) else {
                trace!(worker, id, "Completion for a request no longer pending");
                return;
            };
            if let Some(slot) = state.workers.get_mut(pending.worker) {
                slot.in_flight = slot.in_flight.saturating_sub(1);
            }
            match &result {
                Err(ProEditError::Cancelled) => state.cancelled += 1,
                Ok(_) => {
                    let ms = elapsed.as_secs_f64() * 1000.0;
                    state.avg_decode_ms = if state.completed == 0 {
                        ms
                    } else {
                        DECODE_TIME_ALPHA * ms + (1.0 - DECODE_TIME_ALPHA) * state.avg_decode_ms
                    };
                    state.completed += 1;
                }
                Err(_) => state.failed += 1,
            }
            state.drain_queue(self.config.max_in_flight_per_worker);
            pending
        };

        match result {
            Ok(image) => {
                self.bitmap_cache.set(pending.key, image.clone());
                let _ = pending.reply.send(Ok(image));
            }
            Err(e) => {
                debug!(worker, id, error = %e, "Decode request failed");
                let _ = pending.reply.send(Err(e));
            }
        }
    }

    fn mark_crashed(&self, worker: usize) {
        let mut state = self.state.lock();
        let stranded = state.pending.values().filter(|p| p.worker == worker).count();
        if let Some(slot) = state.workers.get_mut(worker) {
            slot.alive = false;
        }
        let live = state.workers.iter().filter(|w| w.alive).count();
        error!(worker, stranded, live, "Decode worker crashed");
    }
}

async fn drain_events(shared: Arc<PoolShared>, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Decoded {
                worker,
                id,
                result,
                elapsed,
            } => shared.complete(worker, id, result, elapsed),
            WorkerEvent::Crashed { worker } => shared.mark_crashed(worker),
            WorkerEvent::Ready { worker, .. } => {
                debug!(worker, "Late handshake acknowledgement ignored");
            }
        }
    }
    trace!("Decode event channel closed");
}

/// Fixed-size pool of decode workers.
pub struct DecodeWorkerPool {
    shared: Arc<PoolShared>,
    completion: Mutex<Option<JoinHandle<()>>>,
}

impl DecodeWorkerPool {
    /// Spawn workers and wait for each to acknowledge `Init`.
    ///
    /// Worker count is clamped to `1..=num_cpus`. A worker that fails or
    /// does not answer within the handshake timeout fails the whole pool
    /// with [`ProEditError::WorkerInit`], unless `allow_partial_start` is set
    /// and at least one worker came up.
    pub async fn initialize(config: PoolConfig, decoder: Arc<dyn FrameDecoder>) -> Result<Self> {
        let count = config.worker_count.clamp(1, num_cpus::get().max(1));
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(count);
        for id in 0..count {
            let handle = spawn_worker(id, Arc::clone(&decoder), events_tx.clone())?;
            handle.send(WorkerCommand::Init);
            handles.push(handle);
        }

        let mut ready = vec![false; count];
        let mut failures: Vec<(usize, String)> = Vec::new();
        let deadline = tokio::time::Instant::now() + config.handshake_timeout();
        let mut answered = 0;
        while answered < count {
            match tokio::time::timeout_at(deadline, events_rx.recv()).await {
                Ok(Some(WorkerEvent::Ready { worker, result })) => {
                    answered += 1;
                    match result {
                        Ok(()) => ready[worker] = true,
                        Err(e) => failures.push((worker, e.to_string())),
                    }
                }
                Ok(Some(WorkerEvent::Crashed { worker })) => {
                    answered += 1;
                    failures.push((worker, "crashed during startup".to_string()));
                }
                Ok(Some(WorkerEvent::Decoded { .. })) => {}
                Ok(None) | Err(_) => break,
            }
        }
        for (worker, ok) in ready.iter().enumerate() {
            if !ok && !failures.iter().any(|(w, _)| *w == worker) {
                failures.push((
                    worker,
                    format!("no acknowledgement within {}ms", config.handshake_timeout_ms),
                ));
            }
        }
        failures.sort_by_key(|(w, _)| *w);

        let live = ready.iter().filter(|ok| **ok).count();
        if let Some((worker, reason)) = failures.first().cloned() {
            if !config.allow_partial_start || live == 0 {
                error!(worker, %reason, "Decode pool failed to start");
                shutdown_workers(handles);
                return Err(ProEditError::WorkerInit { worker, reason });
            }
            for (worker, reason) in &failures {
                warn!(worker, %reason, "Starting decode pool without worker");
                handles[*worker].send(WorkerCommand::Shutdown);
            }
        }

        let workers = handles
            .into_iter()
            .map(|handle| {
                let alive = ready[handle.id];
                WorkerSlot {
                    handle,
                    in_flight: 0,
                    alive,
                }
            })
            .collect();

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                workers,
                pending: HashMap::new(),
                queue: VecDeque::new(),
                next_id: 0,
                completed: 0,
                failed: 0,
                cancelled: 0,
                avg_decode_ms: 0.0,
                disposed: false,
            }),
            bitmap_cache: FrameCache::new(config.bitmap_cache_frames, config.bitmap_cache_bytes),
            config,
            decoder,
        });
        let completion = tokio::spawn(drain_events(Arc::clone(&shared), events_rx));

        info!(workers = count, live, "Decode pool ready");
        Ok(Self {
            shared,
            completion: Mutex::new(Some(completion)),
        })
    }

    /// Decode one frame.
    ///
    /// Never resolves if the worker holding the request crashes; use
    /// [`decode_frame_timeout`](Self::decode_frame_timeout) where that matters.
    pub async fn decode_frame(&self, request: DecodeRequest) -> Result<DecodedImage> {
        let reply = self.submit(request)?;
        reply.await.map_err(|_| ProEditError::Disposed)?
    }

    /// [`decode_frame`](Self::decode_frame) bounded by `timeout`.
    pub async fn decode_frame_timeout(
        &self,
        request: DecodeRequest,
        timeout: Duration,
    ) -> Result<DecodedImage> {
        let what = format!("decode of clip {} at {:.3}s", request.clip_id, request.time);
        match tokio::time::timeout(timeout, self.decode_frame(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProEditError::Timeout(what)),
        }
    }

    fn submit(&self, request: DecodeRequest) -> Result<oneshot::Receiver<Result<DecodedImage>>> {
        if self.shared.state.lock().disposed {
            return Err(ProEditError::Disposed);
        }
        if request.is_cancelled() {
            return Err(ProEditError::Cancelled);
        }
        let (reply, receiver) = oneshot::channel();
        let key = CacheKey::at(request.clip_id, request.time, self.shared.config.bitmap_cache_rate);
        if let Some(image) = self.shared.bitmap_cache.get(&key) {
            let _ = reply.send(Ok(image));
            return Ok(receiver);
        }

        let mut state = self.shared.state.lock();
        if state.disposed {
            return Err(ProEditError::Disposed);
        }
        if !state.workers.iter().any(|w| w.alive) {
            return Err(ProEditError::Internal("no live decode workers".to_string()));
        }
        let id = state.next_id;
        state.next_id += 1;
        state.dispatch(
            Job {
                id,
                request,
                key,
                reply,
            },
            self.shared.config.max_in_flight_per_worker,
        );
        Ok(receiver)
    }

    /// Cheap openability check against the underlying decoder.
    pub fn probe(&self, source: &SourceRef) -> Result<()> {
        self.shared.decoder.probe(source)
    }

    /// Release a clip's decoder resources on every worker and drop its
    /// bitmap cache entries. Returns how many cache entries were removed.
    pub fn clear_clip(&self, clip_id: Uuid) -> usize {
        {
            let state = self.shared.state.lock();
            for slot in state.workers.iter().filter(|w| w.alive) {
                slot.handle.send(WorkerCommand::ClearClip(clip_id));
            }
        }
        self.shared.bitmap_cache.clear_for(clip_id)
    }

    /// Resolve every queued request whose token was cancelled with
    /// [`ProEditError::Cancelled`]. Returns how many were dropped.
    ///
    /// Requests already handed to a worker are skipped by the worker
    /// instead, unless it has started decoding them.
    pub fn purge_cancelled(&self) -> usize {
        let purged = self.shared.state.lock().purge_cancelled();
        if purged > 0 {
            debug!(purged, "Dropped cancelled decode requests");
        }
        purged
    }

    /// Requests the live workers can hold at once.
    pub fn capacity(&self) -> usize {
        let state = self.shared.state.lock();
        let live = state.workers.iter().filter(|w| w.alive).count();
        live * self.shared.config.max_in_flight_per_worker
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.state.lock().disposed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            workers: state.workers.len(),
            live_workers: state.workers.iter().filter(|w| w.alive).count(),
            pending: state.pending.len(),
            queued: state.queue.len(),
            per_worker: state.workers.iter().map(|w| w.in_flight).collect(),
            completed: state.completed,
            failed: state.failed,
            cancelled: state.cancelled,
            avg_decode_ms: state.avg_decode_ms,
            bitmap_cache: self.shared.bitmap_cache.stats(),
        }
    }

    /// Reject every outstanding request with [`ProEditError::Disposed`],
    /// stop the workers and clear the bitmap cache. Safe to call repeatedly.
    pub fn dispose(&self) {
        let (replies, threads) = {
            let mut state = self.shared.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;

            let mut replies: Vec<Reply> = state.pending.drain().map(|(_, p)| p.reply).collect();
            replies.extend(state.queue.drain(..).map(|job| job.reply));

            let mut threads = Vec::new();
            for slot in &mut state.workers {
                slot.handle.send(WorkerCommand::Shutdown);
                slot.in_flight = 0;
                slot.alive = false;
                if let Some(thread) = slot.handle.thread.take() {
                    threads.push((slot.handle.id, thread));
                }
            }
            (replies, threads)
        };

        let rejected = replies.len();
        for reply in replies {
            let _ = reply.send(Err(ProEditError::Disposed));
        }
        reap_workers(threads, SHUTDOWN_DEADLINE);
        self.shared.bitmap_cache.clear();
        if let Some(completion) = self.completion.lock().take() {
            completion.abort();
        }
        info!(rejected, "Decode pool disposed");
    }
}

impl Drop for DecodeWorkerPool {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn shutdown_workers(handles: Vec<WorkerHandle>) {
    let threads = handles
        .into_iter()
        .filter_map(|mut handle| {
            handle.send(WorkerCommand::Shutdown);
            handle.thread.take().map(|t| (handle.id, t))
        })
        .collect();
    reap_workers(threads, SHUTDOWN_DEADLINE);
}
