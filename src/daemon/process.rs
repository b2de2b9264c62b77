//! Child-process transport: newline-delimited JSON over the daemon's stdin/stdout.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::config::DaemonConfig;
use crate::error::{DaemonError, Result};

use super::{DaemonCommand, DaemonMessage, DaemonTransport, MessageSink};

/// Runs the worker daemon as a child process
///
/// Pipe I/O runs as tasks on the given tokio runtime so the event loop thread
/// never blocks on the daemon. When the child exits after a
/// [`DaemonCommand::Shutdown`] the sink receives
/// [`DaemonMessage::ShutdownComplete`]; any other exit is reported as
/// [`DaemonMessage::Error`].
pub struct ProcessDaemon {
    config: DaemonConfig,
    runtime: Handle,
    commands: Option<mpsc::UnboundedSender<DaemonCommand>>,
    shutdown_requested: Arc<AtomicBool>,
}

impl ProcessDaemon {
    /// Create a transport that will launch `config.program` on `start`
    pub fn new(config: DaemonConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            commands: None,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    fn spawn_child(&self) -> Result<Child> {
        let _guard = self.runtime.enter();
        Command::new(&self.config.program)
            .args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DaemonError::SpawnFailed {
                    program: self.config.program.clone(),
                    reason: e.to_string(),
                }
                .into()
            })
    }
}

impl DaemonTransport for ProcessDaemon {
    fn start(&mut self, sink: MessageSink) -> Result<()> {
        if self.config.program.as_os_str().is_empty() {
            return Err(crate::error::Error::config(
                "no daemon program configured",
                "daemon.program",
            ));
        }

        let mut child = self.spawn_child()?;
        let missing_pipe = || DaemonError::SpawnFailed {
            program: self.config.program.clone(),
            reason: "child stdio was not captured".to_string(),
        };
        let stdin = child.stdin.take().ok_or_else(missing_pipe)?;
        let stdout = child.stdout.take().ok_or_else(missing_pipe)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.runtime.spawn(write_commands(stdin, rx));
        self.runtime.spawn(read_messages(
            child,
            stdout,
            sink,
            Arc::clone(&self.shutdown_requested),
        ));
        self.commands = Some(tx);

        tracing::info!(program = ?self.config.program, "download daemon started");
        Ok(())
    }

    fn send(&mut self, command: DaemonCommand) -> Result<()> {
        let commands = self.commands.as_ref().ok_or(DaemonError::NotStarted)?;
        if matches!(command, DaemonCommand::Shutdown) {
            self.shutdown_requested.store(true, Ordering::SeqCst);
        }
        commands
            .send(command)
            .map_err(|_| DaemonError::Disconnected.into())
    }

    fn describe(&self) -> String {
        format!("daemon process {}", self.config.program.display())
    }
}

async fn write_commands(mut stdin: ChildStdin, mut commands: mpsc::UnboundedReceiver<DaemonCommand>) {
    while let Some(command) = commands.recv().await {
        let mut line = match serde_json::to_vec(&command) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(command = command.kind(), error = %e, "failed to encode daemon command");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = stdin.write_all(&line).await {
            tracing::warn!(error = %e, "daemon stdin closed");
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::warn!(error = %e, "failed to flush daemon stdin");
            break;
        }
    }
}

async fn read_messages(
    mut child: Child,
    stdout: ChildStdout,
    sink: MessageSink,
    shutdown_requested: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<DaemonMessage>(&line) {
                Ok(message) => sink(message),
                Err(e) => {
                    let err = DaemonError::Malformed(e.to_string());
                    tracing::warn!(error = %err, line = %line, "ignoring daemon output");
                }
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read from daemon");
                break;
            }
        }
    }

    match child.wait().await {
        Ok(status) if shutdown_requested.load(Ordering::SeqCst) => {
            tracing::info!(%status, "download daemon exited");
            sink(DaemonMessage::ShutdownComplete);
        }
        Ok(status) => {
            tracing::error!(%status, "download daemon exited unexpectedly");
            sink(DaemonMessage::Error {
                message: format!("daemon exited unexpectedly ({status})"),
            });
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to wait for download daemon");
            sink(DaemonMessage::Error {
                message: e.to_string(),
            });
        }
    }
}
