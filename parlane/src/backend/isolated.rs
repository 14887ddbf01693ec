//! Isolated-memory pool: worker processes driven over stdin/stdout.
//!
//! Each worker process has one driver thread in the parent. Drivers pull
//! chunks from a shared queue, send them as [`Request`]s and report the
//! decoded outcomes. A worker that dies settles its chunk as
//! [`TaskFailure::WorkerLost`] and is replaced on the next chunk. A worker
//! still busy when its chunk's timeout passes is killed, the chunk settles as
//! [`TaskFailure::TimedOut`], and the worker is replaced the same way.

use super::wire::{Request, Response, WireOutcome};
use super::{Backend, Event, EventSender, RemoteSpec};
use crate::cancellation::CancellationToken;
use crate::config::BackendKind;
use crate::core::Outcome;
use crate::errors::{BackendError, TaskFailure};
use crate::worker::WORKER_ENV;
use parking_lot::Mutex;
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The program started for each worker process.
///
/// The program must call [`serve_if_worker`](crate::worker::serve_if_worker)
/// with a registry containing every task it will be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl WorkerCommand {
    /// Runs `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Re-executes the running program.
    pub fn current_exe() -> Result<Self, BackendError> {
        std::env::current_exe()
            .map(Self::new)
            .map_err(|e| BackendError::WorkerProgram {
                reason: e.to_string(),
            })
    }

    /// The program path.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    fn spawn(&self) -> Result<(Child, Pipes), BackendError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| BackendError::spawn(self.program.display().to_string(), e))?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            kill(&mut child);
            return Err(BackendError::spawn(
                self.program.display().to_string(),
                std::io::Error::other("worker pipes unavailable"),
            ));
        };

        let (lines, replies) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name(format!("parlane-reader-{}", child.id()))
            .spawn(move || read_replies(stdout, &lines));
        if let Err(e) = reader {
            kill(&mut child);
            return Err(BackendError::spawn("worker reader thread", e));
        }
        Ok((child, Pipes { stdin, replies }))
    }
}

/// Forwards each line the worker prints until it closes stdout.
fn read_replies(stdout: ChildStdout, lines: &Sender<std::io::Result<String>>) {
    let mut stdout = BufReader::new(stdout);
    loop {
        let mut line = String::new();
        match stdout.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if lines.send(Ok(line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = lines.send(Err(e));
                break;
            }
        }
    }
}

struct Pipes {
    stdin: ChildStdin,
    replies: Receiver<std::io::Result<String>>,
}

/// Why an exchange produced no outcomes.
enum Stalled {
    /// The worker is gone or broke the protocol.
    Lost(String),
    /// The deadline passed with the worker still busy.
    TimedOut,
}

impl Pipes {
    fn exchange(
        &mut self,
        request: &Request,
        deadline: Option<Instant>,
    ) -> Result<Vec<WireOutcome>, Stalled> {
        let line = serde_json::to_string(request).map_err(|e| Stalled::Lost(e.to_string()))?;
        writeln!(self.stdin, "{line}")
            .and_then(|()| self.stdin.flush())
            .map_err(|e| Stalled::Lost(format!("write to worker failed: {e}")))?;

        let exited = || Stalled::Lost("worker process exited".to_string());
        let reply = match deadline {
            Some(deadline) => {
                match self
                    .replies
                    .recv_timeout(deadline.saturating_duration_since(Instant::now()))
                {
                    Ok(reply) => reply,
                    Err(RecvTimeoutError::Timeout) => return Err(Stalled::TimedOut),
                    Err(RecvTimeoutError::Disconnected) => return Err(exited()),
                }
            }
            None => self.replies.recv().map_err(|_| exited())?,
        };
        let reply = reply.map_err(|e| Stalled::Lost(format!("read from worker failed: {e}")))?;

        let response: Response = serde_json::from_str(&reply)
            .map_err(|e| Stalled::Lost(format!("malformed worker response: {e}")))?;
        if response.id != request.id {
            return Err(Stalled::Lost(format!(
                "worker answered request {} while {} was pending",
                response.id, request.id
            )));
        }
        Ok(response.outcomes)
    }
}

type Slot = Arc<Mutex<Option<Child>>>;

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn reap(slot: &Slot) {
    if let Some(mut child) = slot.lock().take() {
        kill(&mut child);
    }
}

struct Chunk<T, R> {
    start: usize,
    items: Vec<T>,
    events: EventSender<R>,
}

fn settle<R>(events: &EventSender<R>, index: usize, outcome: Outcome<R>) {
    let _ = events.send(Event::Settled { index, outcome });
}

/// A fixed set of worker processes.
///
/// On shutdown, queued chunks settle as [`TaskFailure::Cancelled`] and the
/// worker processes are killed, abandoning chunks in flight. With a timeout,
/// each chunk gets that long from the moment a worker receives it.
pub struct IsolatedPool<T, R> {
    workers: usize,
    sender: Option<Sender<Chunk<T, R>>>,
    drivers: Vec<JoinHandle<()>>,
    slots: Vec<Slot>,
    token: Arc<CancellationToken>,
}

impl<T, R> IsolatedPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    /// Starts `workers` processes of `command`, all serving `spec`.
    pub fn new(
        workers: usize,
        spec: RemoteSpec<T, R>,
        command: WorkerCommand,
        timeout: Option<Duration>,
    ) -> Result<Self, BackendError> {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Chunk<T, R>>();
        let receiver = Arc::new(Mutex::new(receiver));
        let token = Arc::new(CancellationToken::new());

        let mut pool = Self {
            workers,
            sender: Some(sender),
            drivers: Vec::with_capacity(workers),
            slots: Vec::with_capacity(workers),
            token,
        };

        let mut started = Vec::with_capacity(workers);
        for _ in 0..workers {
            match command.spawn() {
                Ok((child, pipes)) => {
                    pool.slots.push(Arc::new(Mutex::new(Some(child))));
                    started.push(pipes);
                }
                Err(e) => {
                    pool.stop("spawn failed");
                    return Err(e);
                }
            }
        }

        let slots = pool.slots.clone();
        pool.token.on_cancel(move || {
            for slot in &slots {
                if let Some(child) = slot.lock().as_mut() {
                    let _ = child.kill();
                }
            }
        });

        for (id, pipes) in started.into_iter().enumerate() {
            let driver = Driver {
                id,
                slot: Arc::clone(&pool.slots[id]),
                receiver: Arc::clone(&receiver),
                token: Arc::clone(&pool.token),
                spec,
                command: command.clone(),
                timeout,
                next_request: 0,
            };
            let spawned = std::thread::Builder::new()
                .name(format!("parlane-driver-{id}"))
                .spawn(move || driver.run(Some(pipes)));
            match spawned {
                Ok(handle) => pool.drivers.push(handle),
                Err(e) => {
                    pool.stop("spawn failed");
                    return Err(BackendError::spawn(format!("driver thread {id}"), e));
                }
            }
        }

        debug!(workers, task = spec.name(), program = %command.program().display(), "Isolated pool started");
        Ok(pool)
    }
}

struct Driver<T, R> {
    id: usize,
    slot: Slot,
    receiver: Arc<Mutex<Receiver<Chunk<T, R>>>>,
    token: Arc<CancellationToken>,
    spec: RemoteSpec<T, R>,
    command: WorkerCommand,
    timeout: Option<Duration>,
    next_request: u64,
}

impl<T, R> Driver<T, R> {
    fn run(mut self, mut pipes: Option<Pipes>) {
        loop {
            let message = self.receiver.lock().recv();
            let Ok(chunk) = message else {
                break;
            };

            if self.token.is_cancelled() {
                for index in chunk.start..chunk.start + chunk.items.len() {
                    settle(&chunk.events, index, Err(TaskFailure::cancelled(index)));
                }
                continue;
            }

            if pipes.is_none() {
                match self.respawn() {
                    Ok(io) => pipes = Some(io),
                    Err(reason) => {
                        for index in chunk.start..chunk.start + chunk.items.len() {
                            let failure = TaskFailure::worker_lost(index, &reason);
                            settle(&chunk.events, index, Err(failure));
                        }
                        continue;
                    }
                }
            }
            let Some(io) = pipes.as_mut() else {
                continue;
            };

            if !self.run_chunk(io, chunk) {
                pipes = None;
                reap(&self.slot);
            }
        }
        drop(pipes);
        reap(&self.slot);
    }

    fn respawn(&self) -> Result<Pipes, String> {
        let mut slot = self.slot.lock();
        if self.token.is_cancelled() {
            return Err("pool is shutting down".to_string());
        }
        if let Some(mut old) = slot.take() {
            kill(&mut old);
        }
        let (child, pipes) = self.command.spawn().map_err(|e| e.to_string())?;
        *slot = Some(child);
        debug!(driver = self.id, "Worker process respawned");
        Ok(pipes)
    }

    /// Returns false if the worker must be replaced.
    fn run_chunk(&mut self, pipes: &mut Pipes, chunk: Chunk<T, R>) -> bool {
        let Chunk {
            start,
            items,
            events,
        } = chunk;
        let len = items.len();

        let mut positions = Vec::with_capacity(len);
        let mut inputs = Vec::with_capacity(len);
        for (offset, item) in items.into_iter().enumerate() {
            let index = start + offset;
            match (self.spec.encode)(item) {
                Ok(value) => {
                    positions.push(index);
                    inputs.push(value);
                }
                Err(e) => settle(&events, index, Err(TaskFailure::failed(index, e))),
            }
        }
        if inputs.is_empty() {
            return true;
        }

        self.next_request += 1;
        let request = Request {
            id: self.next_request,
            task: self.spec.name().to_string(),
            inputs,
        };
        let at = Instant::now();
        let _ = events.send(Event::Started { start, len, at });
        let deadline = self.timeout.and_then(|timeout| at.checked_add(timeout));

        let reason = match pipes.exchange(&request, deadline) {
            Ok(outcomes) if outcomes.len() == positions.len() => {
                for (index, outcome) in positions.into_iter().zip(outcomes) {
                    let outcome = match outcome {
                        WireOutcome::Ok(value) => {
                            (self.spec.decode)(value).map_err(|e| TaskFailure::failed(index, e))
                        }
                        WireOutcome::Err(failure) => Err(failure.into_failure(index)),
                    };
                    settle(&events, index, outcome);
                }
                return true;
            }
            Ok(outcomes) => format!(
                "worker returned {} outcomes for {} inputs",
                outcomes.len(),
                positions.len()
            ),
            Err(Stalled::Lost(reason)) => reason,
            Err(Stalled::TimedOut) => {
                let timeout = self.timeout.unwrap_or_default();
                warn!(driver = self.id, start, len, ?timeout, "Worker timed out, replacing it");
                for index in positions {
                    settle(&events, index, Err(TaskFailure::timed_out(index, timeout)));
                }
                return false;
            }
        };

        if !self.token.is_cancelled() {
            warn!(driver = self.id, start, len, reason = %reason, "Worker process lost");
        }
        for index in positions {
            settle(&events, index, Err(TaskFailure::worker_lost(index, &reason)));
        }
        false
    }
}

impl<T, R> Backend<T, R> for IsolatedPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    fn kind(&self) -> BackendKind {
        BackendKind::IsolatedMemory
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn dispatch(&self, start: usize, items: Vec<T>, events: EventSender<R>) {
        let len = items.len();
        let chunk = Chunk {
            start,
            items,
            events: events.clone(),
        };
        let queued = match &self.sender {
            Some(sender) => sender.send(chunk).is_ok(),
            None => false,
        };
        if !queued {
            for index in start..start + len {
                settle(&events, index, Err(TaskFailure::cancelled(index)));
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop("pool shutdown");
    }
}

impl<T, R> IsolatedPool<T, R> {
    fn stop(&mut self, reason: &str) {
        if self.sender.is_none() && self.drivers.is_empty() && self.slots.is_empty() {
            return;
        }
        self.token.cancel(reason);
        self.sender.take();
        for slot in self.slots.drain(..) {
            reap(&slot);
        }
        for handle in self.drivers.drain(..) {
            if handle.join().is_err() {
                warn!("Driver thread exited abnormally");
            }
        }
        debug!(workers = self.workers, reason, "Isolated pool stopped");
    }
}

impl<T, R> Drop for IsolatedPool<T, R> {
    fn drop(&mut self) {
        self.stop("pool dropped");
    }
}
