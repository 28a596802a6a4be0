//! Cancellable child processes with streamed output.
//!
//! Both the build script and the container engine run through
//! [`run_streaming`]: stdout and stderr are pumped concurrently into one
//! queue, in the order produced, and forwarded to the stage's sink. The
//! process is killed as soon as the cancellation token fires.

use crate::channel::{OutputSink, Utf8Chunker};
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Number of trailing output lines kept for error reports.
pub(crate) const TAIL_LINES: usize = 20;

/// Longest line forwarded in line mode; longer lines are split.
const MAX_LINE: usize = 64 * 1024;

/// Read size for raw output.
const READ_CHUNK: usize = 8 * 1024;

/// How long to wait for buffered output after a cancelled process is killed.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// How output is cut before reaching the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputMode {
    /// One message per line.
    Lines,
    /// Chunks as read, split only on UTF-8 boundaries.
    Raw,
}

/// Completed process.
#[derive(Debug)]
pub(crate) struct ProcessOutcome {
    pub status: ExitStatus,
    /// Last output lines (line mode only).
    pub tail: Vec<String>,
}

/// Why a process did not complete.
#[derive(Debug)]
pub(crate) enum ProcessError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    Cancelled,
}

/// Describe an exit status the way shell tooling prints it.
pub(crate) fn describe_status(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit status {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Run `command` to completion, streaming its combined output to `sink`.
///
/// Returns after every forwarded chunk has been handed to the sink. If the
/// token has already fired the process is never spawned.
pub(crate) async fn run_streaming(
    mut command: Command,
    mode: OutputMode,
    cancel: &CancellationToken,
    sink: &OutputSink,
) -> Result<ProcessOutcome, ProcessError> {
    if cancel.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(ProcessError::Spawn)?;
    tracing::debug!(pid = ?child.id(), ?mode, "process started");

    let (tx, rx) = mpsc::channel::<String>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, mode, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, mode, tx.clone()));
    }
    drop(tx);

    let forwarder = forward(rx, sink, mode);
    tokio::pin!(forwarder);

    let joined = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        joined = async { tokio::join!(child.wait(), &mut forwarder) } => Some(joined),
    };

    match joined {
        Some((status, tail)) => {
            let status = status.map_err(ProcessError::Wait)?;
            tracing::debug!(status = %describe_status(&status), "process exited");
            Ok(ProcessOutcome {
                status,
                tail: tail.into(),
            })
        }
        None => {
            tracing::warn!(pid = ?child.id(), "cancellation fired, killing process");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill process");
            }
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut forwarder)
                .await
                .is_err()
            {
                tracing::debug!("output still open after kill, dropping remainder");
            }
            Err(ProcessError::Cancelled)
        }
    }
}

/// Drain the merged output queue into the sink.
///
/// Keeps draining when the client is gone so the pipes never fill up.
async fn forward(
    mut rx: mpsc::Receiver<String>,
    sink: &OutputSink,
    mode: OutputMode,
) -> VecDeque<String> {
    let mut tail = VecDeque::with_capacity(TAIL_LINES);
    let mut client_gone = false;

    while let Some(chunk) = rx.recv().await {
        tracing::trace!(len = chunk.len(), "process output");
        if mode == OutputMode::Lines {
            if tail.len() == TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(chunk.trim_end_matches(['\r', '\n']).to_string());
        }
        if !client_gone && sink.send_text(chunk).await.is_err() {
            tracing::debug!("client channel closed, discarding further output");
            client_gone = true;
        }
    }
    tail
}

async fn pump<R>(pipe: R, mode: OutputMode, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    match mode {
        OutputMode::Lines => pump_lines(pipe, tx).await,
        OutputMode::Raw => pump_raw(pipe, tx).await,
    }
}

async fn pump_lines<R>(pipe: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    loop {
        let available = match reader.fill_buf().await {
            Ok(buf) if buf.is_empty() => break,
            Ok(buf) => buf,
            Err(e) => {
                tracing::debug!(error = %e, "output pipe read failed");
                break;
            }
        };
        let window = &available[..available.len().min(MAX_LINE - line.len())];
        let (used, complete) = match window.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (window.len(), line.len() + window.len() == MAX_LINE),
        };
        line.extend_from_slice(&window[..used]);
        reader.consume(used);
        if complete && !send_line(&mut line, &tx).await {
            return;
        }
    }
    if !line.is_empty() {
        send_line(&mut line, &tx).await;
    }
}

/// Send and clear `line`; false once the receiver is gone.
async fn send_line(line: &mut Vec<u8>, tx: &mpsc::Sender<String>) -> bool {
    if line.last() != Some(&b'\n') {
        line.push(b'\n');
    }
    let text = String::from_utf8_lossy(line).into_owned();
    line.clear();
    tx.send(text).await.is_ok()
}

async fn pump_raw<R>(mut pipe: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let mut chunker = Utf8Chunker::default();
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Some(text) = chunker.push(&buf[..n]) {
                    if tx.send(text).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
    if let Some(rest) = chunker.finish() {
        let _ = tx.send(rest).await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::channel::{ClientChannel, Frame};
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    async fn collect_text(transport: &mut crate::channel::TransportEnd) -> String {
        let mut out = String::new();
        while let Ok(frame) = transport.outbound.try_recv() {
            if let Frame::Text(text) = frame {
                out.push_str(&text);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_lines_from_both_streams() {
        let (channel, mut transport) = ClientChannel::pair(64);
        let sink = OutputSink::new(channel.outbound.clone());
        let cancel = CancellationToken::new();

        let outcome = run_streaming(
            sh("echo one; sleep 0.1; echo two >&2; sleep 0.1; printf three"),
            OutputMode::Lines,
            &cancel,
            &sink,
        )
        .await
        .expect("process should run");

        assert!(outcome.status.success());
        assert_eq!(outcome.tail, vec!["one", "two", "three"]);

        let mut frames = Vec::new();
        while let Ok(frame) = transport.outbound.try_recv() {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 3);
        assert!(frames
            .iter()
            .all(|f| f.as_text().is_some_and(|t| t.ends_with('\n'))));
    }

    #[tokio::test]
    async fn test_tail_keeps_last_lines() {
        let (channel, _transport) = ClientChannel::pair(256);
        let sink = OutputSink::new(channel.outbound.clone());
        let cancel = CancellationToken::new();

        let outcome = run_streaming(
            sh("i=0; while [ $i -lt 30 ]; do echo line$i; i=$((i+1)); done; exit 4"),
            OutputMode::Lines,
            &cancel,
            &sink,
        )
        .await
        .expect("process should run");

        assert_eq!(outcome.status.code(), Some(4));
        assert_eq!(outcome.tail.len(), TAIL_LINES);
        assert_eq!(outcome.tail.first().map(String::as_str), Some("line10"));
        assert_eq!(outcome.tail.last().map(String::as_str), Some("line29"));
        assert_eq!(describe_status(&outcome.status), "exit status 4");
    }

    #[tokio::test]
    async fn test_long_line_without_newline_is_split() {
        let (channel, mut transport) = ClientChannel::pair(64);
        let sink = OutputSink::new(channel.outbound.clone());
        let cancel = CancellationToken::new();

        let outcome = run_streaming(
            sh("head -c 150000 /dev/zero | tr '\\0' x"),
            OutputMode::Lines,
            &cancel,
            &sink,
        )
        .await
        .expect("process should run");
        assert!(outcome.status.success());

        let mut frames = Vec::new();
        while let Ok(frame) = transport.outbound.try_recv() {
            frames.push(frame.as_text().unwrap().to_string());
        }
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() <= MAX_LINE + 1 && f.ends_with('\n')));
        let total: usize = frames.iter().map(|f| f.trim_end_matches('\n').len()).sum();
        assert_eq!(total, 150_000);
    }

    #[tokio::test]
    async fn test_raw_preserves_carriage_returns() {
        let (channel, mut transport) = ClientChannel::pair(64);
        let sink = OutputSink::new(channel.outbound.clone());
        let cancel = CancellationToken::new();

        run_streaming(
            sh("printf '10%%\\r50%%\\r100%%\\n'"),
            OutputMode::Raw,
            &cancel,
            &sink,
        )
        .await
        .expect("process should run");

        assert_eq!(collect_text(&mut transport).await, "10%\r50%\r100%\n");
    }

    #[tokio::test]
    async fn test_cancel_kills_process() {
        let (channel, _transport) = ClientChannel::pair(64);
        let sink = OutputSink::new(channel.outbound.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = run_streaming(sh("exec sleep 30"), OutputMode::Lines, &cancel, &sink).await;

        assert!(matches!(result, Err(ProcessError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled_never_spawns() {
        let (channel, _transport) = ClientChannel::pair(4);
        let sink = OutputSink::new(channel.outbound.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let marker = tempfile::NamedTempFile::new().unwrap();
        let path = marker.path().to_path_buf();
        drop(marker);

        let result = run_streaming(
            sh(&format!("touch {}", path.display())),
            OutputMode::Lines,
            &cancel,
            &sink,
        )
        .await;

        assert!(matches!(result, Err(ProcessError::Cancelled)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (channel, _transport) = ClientChannel::pair(4);
        let sink = OutputSink::new(channel.outbound.clone());
        let cancel = CancellationToken::new();

        let result = run_streaming(
            Command::new("/nonexistent/buildshell-binary"),
            OutputMode::Raw,
            &cancel,
            &sink,
        )
        .await;

        assert!(matches!(result, Err(ProcessError::Spawn(_))));
    }
}
