//! Pipe transport: a JSON-RPC peer across stdin/stdout.
//!
//! Two roles share this module. The spawning role starts a child process
//! and owns its three standard pipes; the served role wires up the
//! bridge's own stdin/stdout when a remote caller drives us. Either way
//! the rest of the crate only ever sees a [`TransportChannels`] pair.
//!
//! Framing is newline-delimited JSON: one envelope per line, no length
//! prefix. Undecodable lines are logged and dropped; the peer cannot be
//! answered on a stream it just corrupted.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::CrosswireError;
use crate::protocol::envelope::Envelope;
use crate::transport::TransportChannels;

/// How to start a child peer for the spawning pipe transport.
#[derive(Debug, Clone, Default)]
pub struct ProcessLaunch {
    /// Program to execute
    pub command: String,
    /// Arguments after the program name
    pub args: Vec<String>,
    /// Explicit child environment entries
    pub env: HashMap<String, String>,
    /// Pass the parent environment through underneath the explicit
    /// entries. Off by default: a relay host tends to carry tokens in its
    /// environment that the tool has no business seeing.
    pub pass_through_env: bool,
}

impl ProcessLaunch {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }
}

/// Owns a spawned child process.
///
/// Teardown calls [`PipeChild::kill`] explicitly; `kill_on_drop` covers
/// the cases where the bridge itself dies first.
#[derive(Debug)]
pub struct PipeChild {
    child: Child,
}

impl PipeChild {
    /// Kill and reap the child. Safe to call after the child has already
    /// exited on its own.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "child already finished");
        }
        match self.child.wait().await {
            Ok(status) => debug!(?status, "child reaped"),
            Err(e) => warn!(error = %e, "failed to reap child"),
        }
    }

    /// OS process id, while the child is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Spawn a child and wire its stdio into envelope channels.
///
/// Channel semantics:
/// - sending on `outbound` writes one line to the child's stdin
/// - `inbound` yields envelopes decoded from the child's stdout and
///   closes at EOF, which is how child exit is observed upstream
///
/// Child stderr is drained into the bridge's own log stream.
pub fn spawn(
    launch: &ProcessLaunch,
    capacity: usize,
) -> Result<(TransportChannels, PipeChild), CrosswireError> {
    let mut command = Command::new(&launch.command);
    command
        .args(&launch.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if !launch.pass_through_env {
        command.env_clear();
    }
    // Explicit entries land last so they win over inherited ones
    command.envs(&launch.env);

    let mut child = command.spawn().map_err(|e| CrosswireError::SpawnFailed {
        command: launch.command.clone(),
        reason: e.to_string(),
    })?;

    let stdin = take_pipe(child.stdin.take(), &launch.command, "stdin")?;
    let stdout = take_pipe(child.stdout.take(), &launch.command, "stdout")?;
    let stderr = take_pipe(child.stderr.take(), &launch.command, "stderr")?;

    debug!(command = %launch.command, pid = ?child.id(), "child spawned");

    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);

    tokio::spawn(write_lines(stdin, outbound_rx));
    tokio::spawn(read_lines(stdout, inbound_tx));
    tokio::spawn(relay_stderr(stderr));

    Ok((
        TransportChannels {
            outbound: outbound_tx,
            inbound: inbound_rx,
        },
        PipeChild { child },
    ))
}

/// Serve the bridge's own stdin/stdout as the downstream pipe.
///
/// In this role stdout belongs to the protocol stream, which is why all
/// logging in this crate goes to stderr.
pub fn current_process(capacity: usize) -> TransportChannels {
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);

    tokio::spawn(read_lines(tokio::io::stdin(), inbound_tx));
    tokio::spawn(write_lines(tokio::io::stdout(), outbound_rx));

    TransportChannels {
        outbound: outbound_tx,
        inbound: inbound_rx,
    }
}

fn take_pipe<T>(
    pipe: Option<T>,
    command: &str,
    name: &str,
) -> Result<T, CrosswireError> {
    pipe.ok_or_else(|| CrosswireError::SpawnFailed {
        command: command.to_string(),
        reason: format!("{} was not captured", name),
    })
}

/// Drain the outbound channel into the sink, one line per envelope.
async fn write_lines<W>(mut sink: W, mut outbound: mpsc::Receiver<Envelope>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = outbound.recv().await {
        let mut line = envelope.to_line();
        line.push('\n');
        if let Err(e) = sink.write_all(line.as_bytes()).await {
            warn!(error = %e, "pipe write failed, stopping writer");
            break;
        }
        if let Err(e) = sink.flush().await {
            warn!(error = %e, "pipe flush failed, stopping writer");
            break;
        }
    }
}

/// Decode lines from the source into the inbound channel until EOF.
///
/// The send applies backpressure: a full channel stalls this reader,
/// which stalls the peer's pipe, instead of queueing without bound.
async fn read_lines<R>(source: R, inbound: mpsc::Sender<Envelope>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(source).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match Envelope::decode(trimmed.as_bytes()) {
                    Ok(envelope) => {
                        if inbound.send(envelope).await.is_err() {
                            // receiver side is tearing down
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "dropping undecodable line from pipe");
                    }
                }
            }
            Ok(None) => {
                debug!("pipe reached EOF");
                break;
            }
            Err(e) => {
                warn!(error = %e, "pipe read failed");
                break;
            }
        }
    }
    // Dropping the sender closes the inbound channel, which is the
    // closure signal the session layer watches for.
}

/// Child diagnostics must not vanish: stderr lines become debug records.
async fn relay_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.is_empty() {
            debug!(child_stderr = %line, "child wrote to stderr");
        }
    }
}
