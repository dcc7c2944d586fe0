use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bootlog_types::LogEntry;

use crate::buffer::EntryBuffer;
use crate::error::{AggregatorError, Result};
use crate::sink::Sink;

/// Lifecycle of the background flusher
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlusherState {
    Idle,
    Woken,
    Draining,
    Stopped,
}

/// What caused a drain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FlushTrigger {
    /// Buffer occupancy reached the threshold
    Threshold,
    /// Periodic timer tick
    Interval,
    /// Explicit flush request
    Request,
    /// Final drain on shutdown
    Shutdown,
    /// Handle dropped without a stop
    Drop,
}

type FlushReply = oneshot::Sender<Result<usize>>;

enum Wake {
    Threshold,
    Interval,
    Request(FlushReply),
    Stop,
}

/// Background task draining an [`EntryBuffer`] into a [`Sink`]
pub struct Flusher {
    buffer: EntryBuffer,

    /// Shared with the handle so a drop can still deliver
    sink: Arc<Mutex<Box<dyn Sink>>>,

    /// Last drain failed; threshold wakes wait for the next tick or request
    sink_failed: bool,

    wake: Arc<Notify>,
    requests: mpsc::UnboundedReceiver<FlushReply>,
    cancel: CancellationToken,
    interval: Duration,
    state: watch::Sender<FlusherState>,

    /// Total lines written to the sink
    flushed: Arc<AtomicU64>,
}

impl Flusher {
    /// Spawn the flusher on the current tokio runtime
    pub fn spawn(buffer: EntryBuffer, sink: Box<dyn Sink>, interval: Duration) -> FlusherHandle {
        let wake = Arc::new(Notify::new());
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(FlusherState::Idle);
        let flushed = Arc::new(AtomicU64::new(0));
        let sink = Arc::new(Mutex::new(sink));

        let flusher = Self {
            buffer: buffer.clone(),
            sink: Arc::clone(&sink),
            sink_failed: false,
            wake: Arc::clone(&wake),
            requests: request_rx,
            cancel: cancel.clone(),
            interval,
            state: state_tx,
            flushed: Arc::clone(&flushed),
        };

        FlusherHandle {
            buffer,
            sink,
            wake,
            requests: request_tx,
            cancel,
            state: state_rx,
            flushed,
            task: Mutex::new(Some(tokio::spawn(flusher.run()))),
        }
    }

    async fn run(mut self) -> Result<usize> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        info!(interval_ms = self.interval.as_millis() as u64, "flusher started");

        loop {
            let wake = tokio::select! {
                biased;

                _ = self.cancel.cancelled() => Wake::Stop,

                Some(reply) = self.requests.recv() => Wake::Request(reply),

                _ = self.wake.notified() => Wake::Threshold,

                _ = ticker.tick() => Wake::Interval,
            };

            self.state.send_replace(FlusherState::Woken);
            match wake {
                Wake::Stop => break,
                Wake::Request(reply) => {
                    let result = self.drain_to_sink(FlushTrigger::Request).await;
                    self.state.send_replace(FlusherState::Idle);
                    // Caller may have given up waiting
                    let _ = reply.send(result);
                }
                Wake::Threshold if self.sink_failed => {}
                Wake::Threshold => {
                    let _ = self.drain_to_sink(FlushTrigger::Threshold).await;
                }
                Wake::Interval => {
                    let _ = self.drain_to_sink(FlushTrigger::Interval).await;
                }
            }
            self.state.send_replace(FlusherState::Idle);
        }

        // Requests still queued are dropped; their callers see `Closed`
        self.requests.close();
        let result = self.drain_to_sink(FlushTrigger::Shutdown).await;
        self.state.send_replace(FlusherState::Stopped);
        info!(
            flushed = self.flushed.load(Ordering::Relaxed),
            "flusher stopped"
        );
        result
    }

    /// Deliver the buffer on the blocking pool
    async fn drain_to_sink(&mut self, trigger: FlushTrigger) -> Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        self.state.send_replace(FlusherState::Draining);
        let buffer = self.buffer.clone();
        let sink = Arc::clone(&self.sink);
        let flushed = Arc::clone(&self.flushed);
        let written =
            tokio::task::spawn_blocking(move || deliver(&buffer, &sink, &flushed, trigger)).await?;

        self.sink_failed = written.is_err();
        written.map_err(AggregatorError::SinkUnavailable)
    }
}

/// Write every pending entry to `sink`, removing them only on success
///
/// The sink lock is held from peek to commit, so two deliveries never write
/// the same entry.
fn deliver(
    buffer: &EntryBuffer,
    sink: &Mutex<Box<dyn Sink>>,
    flushed: &AtomicU64,
    trigger: FlushTrigger,
) -> io::Result<usize> {
    let mut sink = sink.lock();
    let batch = buffer.peek(None);
    if batch.is_empty() {
        return Ok(0);
    }

    let started = Instant::now();
    let lines: Vec<String> = batch.entries.iter().map(LogEntry::to_line).collect();

    match sink.append(&lines).and_then(|()| sink.flush()) {
        Ok(()) => {
            let removed = buffer.commit(&batch);
            flushed.fetch_add(batch.len() as u64, Ordering::Relaxed);
            debug!(
                ?trigger,
                lines = batch.len(),
                removed,
                elapsed_us = started.elapsed().as_micros() as u64,
                "flushed entries"
            );
            Ok(batch.len())
        }
        Err(e) => {
            warn!(
                ?trigger,
                pending = batch.len(),
                error = %e,
                "sink unavailable, keeping entries buffered"
            );
            Err(e)
        }
    }
}

/// Control side of a running [`Flusher`]
pub struct FlusherHandle {
    buffer: EntryBuffer,
    sink: Arc<Mutex<Box<dyn Sink>>>,
    wake: Arc<Notify>,
    requests: mpsc::UnboundedSender<FlushReply>,
    cancel: CancellationToken,
    state: watch::Receiver<FlusherState>,
    flushed: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<Result<usize>>>>,
}

impl FlusherHandle {
    /// Signal a threshold-driven drain (never blocks)
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Ask for an immediate drain and wait for its result
    pub async fn flush(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(reply_tx)
            .map_err(|_| AggregatorError::Closed)?;
        reply_rx.await.map_err(|_| AggregatorError::Closed)?
    }

    pub fn state(&self) -> FlusherState {
        *self.state.borrow()
    }

    /// Total lines written so far
    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    /// Stop the timer, let any in-flight drain finish, then drain one last time
    ///
    /// Blocks for as long as the sink takes; there is no timeout.
    pub async fn stop(&self) -> Result<usize> {
        self.cancel.cancel();
        let task = self.task.lock().take();
        match task {
            Some(task) => task.await?,
            None => Ok(0),
        }
    }
}

impl Drop for FlusherHandle {
    /// Deliver what is left synchronously when never stopped
    ///
    /// The runtime may be torn down before the task gets to its final drain.
    /// If it does run, it finds the buffer already delivered.
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.task.get_mut().is_some() {
            let _ = deliver(&self.buffer, &self.sink, &self.flushed, FlushTrigger::Drop);
        }
    }
}
