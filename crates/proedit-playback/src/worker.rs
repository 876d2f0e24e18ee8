//! Decode worker threads and their message protocol.

use crate::decode::{ClipDecoder, FrameDecoder};
use crate::decode_pool::DecodeRequest;
use crossbeam_channel::{Receiver, Sender};
use proedit_core::{DecodedImage, ProEditError, Result};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub(crate) type RequestId = u64;

/// Pool → worker.
pub(crate) enum WorkerCommand {
    Init,
    Decode { id: RequestId, request: DecodeRequest },
    ClearClip(Uuid),
    Shutdown,
}

/// Worker → pool.
pub(crate) enum WorkerEvent {
    Ready {
        worker: usize,
        result: Result<()>,
    },
    Decoded {
        worker: usize,
        id: RequestId,
        result: Result<DecodedImage>,
        elapsed: Duration,
    },
    Crashed {
        worker: usize,
    },
}

/// Pool-side handle to one worker thread.
pub(crate) struct WorkerHandle {
    pub id: usize,
    pub commands: Sender<WorkerCommand>,
    pub thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn send(&self, command: WorkerCommand) -> bool {
        self.commands.send(command).is_ok()
    }
}

pub(crate) fn spawn_worker(
    id: usize,
    decoder: Arc<dyn FrameDecoder>,
    events: UnboundedSender<WorkerEvent>,
) -> Result<WorkerHandle> {
    let (commands, inbox) = crossbeam_channel::unbounded();
    let thread = std::thread::Builder::new()
        .name(format!("proedit-decode-{id}"))
        .spawn(move || run_worker(id, decoder, inbox, events))?;
    Ok(WorkerHandle {
        id,
        commands,
        thread: Some(thread),
    })
}

/// Posts `Crashed` if the worker thread unwinds.
struct CrashGuard {
    worker: usize,
    events: UnboundedSender<WorkerEvent>,
}

impl Drop for CrashGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let _ = self.events.send(WorkerEvent::Crashed {
                worker: self.worker,
            });
        }
    }
}

fn run_worker(
    worker: usize,
    decoder: Arc<dyn FrameDecoder>,
    inbox: Receiver<WorkerCommand>,
    events: UnboundedSender<WorkerEvent>,
) {
    let _guard = CrashGuard {
        worker,
        events: events.clone(),
    };
    // Open decoders, reused across requests for the same clip
    let mut clips: HashMap<Uuid, Box<dyn ClipDecoder>> = HashMap::new();

    while let Ok(command) = inbox.recv() {
        match command {
            WorkerCommand::Init => {
                let result = decoder.init_worker(worker);
                if events.send(WorkerEvent::Ready { worker, result }).is_err() {
                    break;
                }
            }
            WorkerCommand::Decode { id, request } => {
                let started = Instant::now();
                let result = if request.is_cancelled() {
                    trace!(worker, id, "Skipping cancelled request");
                    Err(ProEditError::Cancelled)
                } else {
                    decode_one(decoder.as_ref(), &mut clips, &request)
                };
                let elapsed = started.elapsed();
                trace!(worker, id, ms = elapsed.as_secs_f64() * 1000.0, "Decoded");
                let event = WorkerEvent::Decoded {
                    worker,
                    id,
                    result,
                    elapsed,
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            WorkerCommand::ClearClip(clip) => {
                if clips.remove(&clip).is_some() {
                    debug!(worker, clip = %clip, "Released clip decoder");
                }
            }
            WorkerCommand::Shutdown => break,
        }
    }
    debug!(worker, open_clips = clips.len(), "Decode worker exiting");
}

fn decode_one(
    decoder: &dyn FrameDecoder,
    clips: &mut HashMap<Uuid, Box<dyn ClipDecoder>>,
    request: &DecodeRequest,
) -> Result<DecodedImage> {
    let clip = match clips.entry(request.clip_id) {
        Entry::Occupied(entry) => entry.into_mut(),
        Entry::Vacant(entry) => entry.insert(decoder.open(&request.source)?),
    };
    clip.decode(request.time, request.width, request.height)
}

/// Join worker threads within `deadline`. Inside a tokio runtime the join
/// runs on the blocking pool and this returns at once.
pub(crate) fn reap_workers(threads: Vec<(usize, JoinHandle<()>)>, deadline: Duration) {
    if threads.is_empty() {
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(move || join_with_deadline(threads, deadline));
        }
        Err(_) => join_with_deadline(threads, deadline),
    }
}

/// Join worker threads, giving them `deadline` in total to exit. Threads
/// still running afterwards are detached.
fn join_with_deadline(threads: Vec<(usize, JoinHandle<()>)>, deadline: Duration) {
    let started = Instant::now();
    for (worker, thread) in threads {
        while !thread.is_finished() && started.elapsed() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if thread.is_finished() {
            if thread.join().is_err() {
                debug!(worker, "Decode worker had panicked");
            }
        } else {
            warn!(worker, "Decode worker did not stop within {:?}, detaching", deadline);
        }
    }
}
