//! Compiler session management.
//!
//! Owns a persistent external compiler worker process and hides its cost and
//! failure modes behind `submit(job) -> outcome`. Batches are processed to
//! completion in submission order; a worker crash fails the in-flight batch
//! with a "compiler unavailable" diagnostic and the next submission starts a
//! fresh worker. An idle worker is shut down after a quiet period.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::protocol::{
    read_message, write_message, AssemblyPayload, CompilePayload, MessageBody, WorkerMessage,
};
use crate::config::CompilerConfig;
use crate::error::{ForgeError, ForgeResult};

/// Session-level settings, derived from [`CompilerConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Worker command
    pub command: String,
    /// Worker arguments
    pub args: Vec<String>,
    /// How long to wait for the Ready handshake
    pub ready_timeout: Duration,
    /// How long to wait for a compile reply
    pub compile_timeout: Duration,
    /// Quiet period after which the worker is shut down
    pub idle_shutdown: Duration,
}

impl From<&CompilerConfig> for SessionConfig {
    fn from(config: &CompilerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            ready_timeout: config.ready_timeout(),
            compile_timeout: config.compile_timeout(),
            idle_shutdown: config.idle_shutdown(),
        }
    }
}

/// One compiler invocation handed to the session.
#[derive(Debug)]
pub struct CompileJob {
    /// Batch id, for logging
    pub batch_id: u64,
    /// The wire payload
    pub payload: CompilePayload,
    /// Member source file names, used to attribute diagnostics
    pub unit_files: Vec<String>,
}

/// Result of one compiler invocation that produced a reply.
#[derive(Debug)]
pub struct CompileOutcome {
    /// Compiled bytes; `None` when the compiler reported errors
    pub assembly: Option<Vec<u8>>,
    /// Raw compiler output for diagnostic scraping
    pub output: String,
    /// Round-trip duration
    pub duration: Duration,
}

/// One compiler output line, attributed to a source file when possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Source file the line mentions, if any
    pub file: Option<String>,
    /// The diagnostic text
    pub message: String,
}

/// Match compiler output lines against member file names.
///
/// Lines that mention no known file are kept with `file: None` and logged
/// generically by the caller.
pub fn attribute_diagnostics(output: &str, unit_files: &[String]) -> Vec<Diagnostic> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| Diagnostic {
            file: unit_files.iter().find(|f| line.contains(f.as_str())).cloned(),
            message: line.to_string(),
        })
        .collect()
}

struct Request {
    job: CompileJob,
    reply: oneshot::Sender<ForgeResult<CompileOutcome>>,
}

/// Handle to the compiler session actor.
#[derive(Clone)]
pub struct CompilerSession {
    tx: mpsc::Sender<Request>,
}

impl CompilerSession {
    /// Start a session. The worker process itself is spawned lazily on the
    /// first submission.
    pub fn spawn(config: SessionConfig) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_session(config, rx));
        Self { tx }
    }

    /// Submit a batch and wait for its outcome.
    ///
    /// Submissions are processed strictly in order; requests made while the
    /// worker is still starting queue behind the handshake.
    pub async fn submit(&self, job: CompileJob) -> ForgeResult<CompileOutcome> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Request { job, reply: reply_tx })
            .await
            .map_err(|_| ForgeError::Infrastructure("compiler session terminated".to_string()))?;
        reply_rx
            .await
            .map_err(|_| ForgeError::Infrastructure("compiler session dropped the request".to_string()))?
    }
}

struct Worker {
    child: Child,
    writer: ChildStdin,
    reader: BufReader<ChildStdout>,
    /// Request ids are per-worker; a respawned worker starts over at 1.
    next_id: u64,
}

async fn run_session(config: SessionConfig, mut rx: mpsc::Receiver<Request>) {
    let mut worker: Option<Worker> = None;

    loop {
        let request = if worker.is_some() {
            tokio::select! {
                request = rx.recv() => request,
                () = tokio::time::sleep(config.idle_shutdown) => {
                    if let Some(idle) = worker.take() {
                        info!("compiler worker idle for {:?}, shutting it down", config.idle_shutdown);
                        shutdown_worker(idle).await;
                    }
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        let Some(Request { job, reply }) = request else {
            if let Some(last) = worker.take() {
                shutdown_worker(last).await;
            }
            break;
        };

        let batch_id = job.batch_id;
        let result = run_job(&config, &mut worker, job).await;
        if let Err(e) = &result {
            // Tear down so the next submission starts a fresh worker.
            warn!(batch = batch_id, "compiler invocation failed: {e}");
            if let Some(broken) = worker.take() {
                kill_worker(broken).await;
            }
        }
        let _ = reply.send(result);
    }
}

async fn run_job(
    config: &SessionConfig,
    worker: &mut Option<Worker>,
    job: CompileJob,
) -> ForgeResult<CompileOutcome> {
    if worker.is_none() {
        *worker = Some(start_worker(config).await?);
    }
    let active = worker.as_mut().expect("worker started above");
    let id = active.next_id;
    active.next_id += 1;

    let started = Instant::now();
    debug!(batch = job.batch_id, sources = job.payload.sources.len(), "submitting compile request");

    write_message(&mut active.writer, &WorkerMessage { id, body: MessageBody::Compile(job.payload) })
        .await
        .map_err(|e| ForgeError::Infrastructure(format!("compiler unavailable: {e}")))?;

    let reply = tokio::time::timeout(config.compile_timeout, await_reply(active, id)).await;
    match reply {
        Ok(Ok(payload)) => {
            let assembly = payload.bytes().map_err(|e| {
                ForgeError::Infrastructure(format!("compiler produced undecodable bytes: {e}"))
            })?;
            Ok(CompileOutcome { assembly, output: payload.output, duration: started.elapsed() })
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(ForgeError::Infrastructure(format!(
            "compilation timed out after {:?}",
            config.compile_timeout
        ))),
    }
}

async fn await_reply(worker: &mut Worker, id: u64) -> ForgeResult<AssemblyPayload> {
    loop {
        match read_message(&mut worker.reader).await {
            Ok(Some(message)) => match message.body {
                MessageBody::Assembly(payload) if message.id == id => return Ok(payload),
                MessageBody::Error(payload) => {
                    return Err(ForgeError::Infrastructure(payload.message));
                }
                MessageBody::Ready => debug!("late ready frame, ignoring"),
                other => {
                    debug!(id = message.id, kind = ?other, "ignoring out-of-band worker frame");
                }
            },
            Ok(None) => {
                return Err(ForgeError::Infrastructure(
                    "compiler unavailable: worker closed the channel".to_string(),
                ));
            }
            Err(e) => {
                return Err(ForgeError::Infrastructure(format!("compiler unavailable: {e}")));
            }
        }
    }
}

async fn start_worker(config: &SessionConfig) -> ForgeResult<Worker> {
    info!(command = %config.command, "starting compiler worker");

    let mut child = Command::new(&config.command)
        .args(&config.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ForgeError::Infrastructure(format!("failed to spawn compiler worker: {e}")))?;

    let writer = child
        .stdin
        .take()
        .ok_or_else(|| ForgeError::Infrastructure("failed to capture worker stdin".to_string()))?;
    let reader = BufReader::new(child.stdout.take().ok_or_else(|| {
        ForgeError::Infrastructure("failed to capture worker stdout".to_string())
    })?);

    let mut worker = Worker { child, writer, reader, next_id: 1 };

    let handshake = tokio::time::timeout(config.ready_timeout, async {
        loop {
            match read_message(&mut worker.reader).await {
                Ok(Some(message)) => match message.body {
                    MessageBody::Ready => return Ok(()),
                    MessageBody::Error(payload) => {
                        return Err(ForgeError::Infrastructure(payload.message))
                    }
                    other => debug!(kind = ?other, "frame before ready, ignoring"),
                },
                Ok(None) => {
                    return Err(ForgeError::Infrastructure(
                        "compiler unavailable: worker exited before ready".to_string(),
                    ))
                }
                Err(e) => return Err(ForgeError::Infrastructure(format!("compiler unavailable: {e}"))),
            }
        }
    })
    .await;

    match handshake {
        Ok(Ok(())) => {
            debug!("compiler worker ready");
            Ok(worker)
        }
        Ok(Err(e)) => {
            kill_worker(worker).await;
            Err(e)
        }
        Err(_) => {
            kill_worker(worker).await;
            Err(ForgeError::Infrastructure(format!(
                "compiler worker not ready after {:?}",
                config.ready_timeout
            )))
        }
    }
}

/// Ask the worker to exit, then reap it (killing after a short grace period).
async fn shutdown_worker(mut worker: Worker) {
    let _ = write_message(&mut worker.writer, &WorkerMessage { id: 0, body: MessageBody::Exit }).await;
    if tokio::time::timeout(Duration::from_secs(2), worker.child.wait()).await.is_err() {
        let _ = worker.child.start_kill();
        let _ = worker.child.wait().await;
    }
}

async fn kill_worker(mut worker: Worker) {
    let _ = worker.child.start_kill();
    let _ = worker.child.wait().await;
}
