#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! A single dedicated-thread, FIFO executor that serializes every state
//! mutation of the dependency manager.
//!
//! The framework owns exactly one [`EventLoop`] per process. It runs a
//! single-threaded Tokio runtime on a native OS thread (the same pattern
//! `engine::thread_per_core` uses to pin one runtime per core), draining a
//! `flume` channel of opaque [`EventLoopTask`]s in submission order. Tasks may
//! be `async` themselves (e.g. to call into the registry), but at most one
//! task runs at a time and no two ever run concurrently.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    thread::{JoinHandle, ThreadId},
};

use async_trait::async_trait;
use tracing::{error, trace};

/// All the errors that can occur when using the [`EventLoop`].
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The loop's queue has been closed (the loop thread has shut down).
    #[error("event loop queue closed")]
    Closed,
}

/// A unit of work executed on the event loop thread.
///
/// Modeled after the framework's `(bundle_id, label, data, process_fn,
/// release_fn)` generic work item: `data` becomes `Self`'s fields, `process_fn`
/// becomes [`EventLoopTask::run`], and `release_fn` becomes `Self`'s `Drop`
/// implementation (idiomatic Rust has no need for a second callback).
#[async_trait]
pub trait EventLoopTask: Send {
    /// Runs this task. Invoked on the event loop thread; must not block for
    /// longer than the caller is willing to stall every other component.
    async fn run(self: Box<Self>);
}

struct Envelope {
    bundle_id: i64,
    label: &'static str,
    task: Box<dyn EventLoopTask>,
}

enum Msg {
    Task(Envelope),
    Stop,
}

struct Barrier {
    done: flume::Sender<()>,
}

#[async_trait]
impl EventLoopTask for Barrier {
    async fn run(self: Box<Self>) {
        let _ = self.done.send(());
    }
}

/// A cheap, cloneable handle used to submit work to the event loop and to
/// query its identity from any thread.
#[derive(Clone)]
pub struct EventLoopHandle {
    sender: flume::Sender<Msg>,
    loop_thread: ThreadId,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopHandle").field("loop_thread", &self.loop_thread).finish()
    }
}

impl EventLoopHandle {
    /// Enqueues a task. May be called from any thread, including the loop
    /// thread itself. Tasks run strictly in submission order relative to
    /// other tasks submitted through the same handle family.
    pub fn fire_generic(&self, bundle_id: i64, label: &'static str, task: Box<dyn EventLoopTask>) -> Result<(), Error> {
        trace!(bundle_id, label, "enqueueing event loop task");
        self.sender.send(Msg::Task(Envelope { bundle_id, label, task })).map_err(|_| Error::Closed)
    }

    /// Returns `true` if the calling thread is the event loop thread.
    pub fn is_current_thread_event_loop(&self) -> bool {
        std::thread::current().id() == self.loop_thread
    }

    /// Blocks the caller until the queue has drained past the point of this
    /// call. Must not be called from the loop thread itself: doing so is a
    /// programmer error, logged rather than allowed to deadlock.
    pub fn wait_for_empty_queue(&self) {
        if self.is_current_thread_event_loop() {
            error!("wait_for_empty_queue called from the event loop thread; ignoring to avoid a deadlock");
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let (done_tx, done_rx) = flume::bounded(1);
        if self.fire_generic(-1, "wait_for_empty_queue barrier", Box::new(Barrier { done: done_tx })).is_err() {
            return;
        }
        let _ = done_rx.recv();
    }

    /// Returns `true` once the loop thread has shut down and no further work
    /// will be processed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Owns the event loop's background thread. Dropping it requests a clean
/// shutdown and joins the thread.
pub struct EventLoop {
    handle: EventLoopHandle,
    join: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Spawns the event loop thread and its single-threaded Tokio runtime.
    pub fn start() -> Self {
        let (sender, receiver) = flume::unbounded::<Msg>();
        let closed = Arc::new(AtomicBool::new(false));
        let closed_for_thread = closed.clone();

        let join = std::thread::Builder::new()
            .name("dm-event-loop".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build the event loop's tokio runtime");

                runtime.block_on(async move {
                    while let Ok(msg) = receiver.recv_async().await {
                        match msg {
                            Msg::Task(envelope) => {
                                trace!(bundle_id = envelope.bundle_id, label = envelope.label, "processing event loop task");
                                envelope.task.run().await;
                            }
                            Msg::Stop => break,
                        }
                    }
                });

                closed_for_thread.store(true, Ordering::Release);
            })
            .expect("failed to spawn the event loop thread");

        let loop_thread = join.thread().id();

        EventLoop {
            handle: EventLoopHandle { sender, loop_thread, closed },
            join: Some(join),
        }
    }

    /// Returns a cloneable handle to this event loop.
    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    /// Requests a clean shutdown and blocks until the loop thread has
    /// drained its queue (everything submitted before this call) and exited.
    pub fn shutdown(mut self) {
        let _ = self.handle.sender.send(Msg::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.handle.sender.send(Msg::Stop);
            let _ = join.join();
        }
    }
}
