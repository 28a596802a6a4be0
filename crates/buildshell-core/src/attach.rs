//! Interactive container attached to a pseudo-terminal.
//!
//! `portable-pty` exposes blocking readers and writers, so each direction is
//! bridged to the async side by a dedicated OS thread and a bounded queue.

use crate::config::TerminalSize;
use crate::error::{CoreError, Result};
use crate::image::ImageTag;
use crate::session::Stage;
use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Read size for terminal output.
const READ_CHUNK: usize = 4096;

/// Depth of the terminal input and output queues.
const TERMINAL_QUEUE: usize = 64;

/// How often the waiter checks whether the terminal process exited.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Starts interactive processes inside built images.
#[async_trait]
pub trait TerminalAttacher: Send + Sync {
    /// Start the image's shell bound to a pseudo-terminal.
    async fn attach(
        &self,
        image: &ImageTag,
        size: TerminalSize,
        cancel: &CancellationToken,
    ) -> Result<AttachedTerminal>;
}

type Terminator = Box<dyn FnOnce() + Send>;

/// Duplex byte stream bound to a live containerized process.
///
/// `output` closes when the process exits. Dropping the terminal (or its
/// [`TerminalGuard`]) kills the process and releases the pseudo-terminal.
pub struct AttachedTerminal {
    output: mpsc::Receiver<Bytes>,
    input: mpsc::Sender<Bytes>,
    guard: TerminalGuard,
}

impl AttachedTerminal {
    /// Assemble a terminal from its streams and a terminate action.
    pub fn new(
        output: mpsc::Receiver<Bytes>,
        input: mpsc::Sender<Bytes>,
        terminate: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            output,
            input,
            guard: TerminalGuard(Some(Box::new(terminate))),
        }
    }

    /// Split into output stream, input stream and lifetime guard.
    pub fn into_parts(self) -> (mpsc::Receiver<Bytes>, mpsc::Sender<Bytes>, TerminalGuard) {
        (self.output, self.input, self.guard)
    }
}

impl std::fmt::Debug for AttachedTerminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachedTerminal")
            .field("terminated", &self.guard.0.is_none())
            .finish()
    }
}

/// Terminates the attached process exactly once, at the latest on drop.
pub struct TerminalGuard(Option<Terminator>);

impl TerminalGuard {
    /// Kill the process and release the pseudo-terminal.
    pub fn terminate(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(terminate) = self.0.take() {
            terminate();
        }
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        self.run();
    }
}

/// [`TerminalAttacher`] running
/// `docker run -it --rm --name <container> <image> <shell>`.
#[derive(Debug, Clone)]
pub struct DockerAttacher {
    engine: String,
    shell: String,
}

impl DockerAttacher {
    /// Create an attacher invoking `engine` and starting `shell`.
    pub fn new(engine: impl Into<String>, shell: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            shell: shell.into(),
        }
    }

    fn spawn(&self, image: &ImageTag, size: TerminalSize) -> Result<AttachedTerminal> {
        let attach_err = |what: &str, e: &dyn std::fmt::Display| {
            CoreError::Attach(format!("{what}: {e}"))
        };

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| attach_err("opening pseudo-terminal", &e))?;

        let container = image.container_name();
        let mut cmd = CommandBuilder::new(&self.engine);
        cmd.args([
            "run",
            "-it",
            "--rm",
            "--name",
            container.as_str(),
            image.as_str(),
            self.shell.as_str(),
        ]);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| attach_err(&format!("starting {}", self.engine), &e))?;
        // The master only sees EOF once no slave handle is left in this process.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| attach_err("cloning terminal reader", &e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| attach_err("taking terminal writer", &e))?;
        let master = pair.master;

        let (output_tx, output_rx) = mpsc::channel(TERMINAL_QUEUE);
        let (input_tx, input_rx) = mpsc::channel(TERMINAL_QUEUE);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        spawn_thread("buildshell-pty-read", move || read_loop(reader, output_tx))?;
        spawn_thread("buildshell-pty-write", move || write_loop(writer, input_rx))?;
        let engine = self.engine.clone();
        spawn_thread("buildshell-pty-wait", move || {
            wait_loop(child, stop_rx, &engine, &container)
        })?;

        Ok(AttachedTerminal::new(output_rx, input_tx, move || {
            // A closed receiver means the process already exited.
            let _ = stop_tx.send(());
            drop(master);
        }))
    }
}

#[async_trait]
impl TerminalAttacher for DockerAttacher {
    async fn attach(
        &self,
        image: &ImageTag,
        size: TerminalSize,
        cancel: &CancellationToken,
    ) -> Result<AttachedTerminal> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled {
                stage: Stage::Attaching,
            });
        }
        tracing::info!(%image, shell = %self.shell, cols = size.cols, rows = size.rows, "Attaching terminal");
        self.spawn(image, size)
    }
}

fn spawn_thread(name: &str, f: impl FnOnce() + Send + 'static) -> Result<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
        .map_err(|e| CoreError::Attach(format!("spawning {name}: {e}")))
}

/// Reap the terminal process, or kill it once a stop request arrives.
///
/// `Child::kill` sends SIGHUP and escalates to SIGKILL after a short grace
/// period. Killing the engine client does not stop the container, so a
/// killed session also removes the container by name.
fn wait_loop(
    mut child: Box<dyn Child + Send + Sync>,
    stop: std::sync::mpsc::Receiver<()>,
    engine: &str,
    container: &str,
) {
    loop {
        match stop.recv_timeout(WAIT_POLL) {
            Err(RecvTimeoutError::Timeout) => match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!(success = status.success(), "Terminal process exited");
                    return;
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll terminal process");
                    return;
                }
            },
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    tracing::debug!(pid = ?child.process_id(), %container, "Killing terminal process");
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "Terminal process already gone");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(error = %e, "Failed to reap terminal process");
    }

    match std::process::Command::new(engine)
        .args(["rm", "-f", container])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => tracing::debug!(%container, "Container removed"),
        Ok(status) => tracing::debug!(%container, ?status, "Container removal failed"),
        Err(e) => tracing::warn!(%container, error = %e, "Failed to run container removal"),
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Bytes>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            // EIO is how Linux reports a hung-up pty once the process exits.
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break;
                }
            }
        }
    }
    tracing::trace!("Terminal output closed");
}

fn write_loop(mut writer: Box<dyn Write + Send>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = rx.blocking_recv() {
        if writer.write_all(&bytes).and_then(|_| writer.flush()).is_err() {
            break;
        }
    }
    tracing::trace!("Terminal input closed");
}
