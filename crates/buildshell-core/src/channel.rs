//! Duplex client channel and per-stage output sinks.
//!
//! A session talks to its client through two bounded queues: an inbound
//! queue of raw client bytes and an outbound queue of [`Frame`]s. The
//! transport (for example a WebSocket) owns the other ends and pumps each
//! direction in its own task, so the session never touches the socket.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// A message sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Status, diagnostic or log text (pre-interactive stages).
    Text(String),
    /// Raw terminal bytes (interactive stage only).
    Binary(Bytes),
}

impl Frame {
    /// Text content, if this is a text frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

/// Session side of the duplex channel.
///
/// `inbound` yields bytes sent by the client and returns `None` once the
/// client disconnects.
#[derive(Debug)]
pub struct ClientChannel {
    /// Bytes typed or sent by the client.
    pub inbound: mpsc::Receiver<Bytes>,
    /// Frames destined to the client.
    pub outbound: mpsc::Sender<Frame>,
}

/// Transport side of the duplex channel.
#[derive(Debug)]
pub struct TransportEnd {
    /// Forward client bytes into the session.
    pub inbound: mpsc::Sender<Bytes>,
    /// Frames the transport must deliver to the client, in order.
    pub outbound: mpsc::Receiver<Frame>,
}

impl ClientChannel {
    /// Create a connected channel pair with bounded queues.
    pub fn pair(capacity: usize) -> (ClientChannel, TransportEnd) {
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel(capacity);
        (
            ClientChannel {
                inbound: in_rx,
                outbound: out_tx,
            },
            TransportEnd {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

/// The client went away; further output is dropped.
#[derive(Debug, Clone, Copy, Error)]
#[error("client channel closed")]
pub struct SinkClosed;

/// Consumer of a stage's output.
///
/// Every sink of a session writes to the same outbound queue, which keeps the
/// client's view ordered by stage.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<Frame>,
}

impl OutputSink {
    /// Create a sink writing to the given outbound queue.
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        Self { tx }
    }

    /// Send one log line; a trailing newline is added when missing.
    pub async fn send_line(&self, line: &str) -> Result<(), SinkClosed> {
        let mut text = line.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        self.send_text(text).await
    }

    /// Send text exactly as given.
    pub async fn send_text(&self, text: String) -> Result<(), SinkClosed> {
        self.tx.send(Frame::Text(text)).await.map_err(|_| SinkClosed)
    }
}

/// Splits a raw byte stream into valid UTF-8 text chunks.
///
/// Multi-byte characters cut by a read boundary are held back until the next
/// push. Invalid sequences become U+FFFD. Carriage returns and escape
/// sequences pass through untouched.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    /// Feed bytes, returning whatever text is complete.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);

        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let tail = rest.to_vec();
        self.pending = tail;

        (!out.is_empty()).then_some(out)
    }

    /// Flush any held-back bytes at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunker_passes_ascii() {
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(b"step 1/3\r").as_deref(), Some("step 1/3\r"));
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn test_chunker_holds_split_character() {
        let bytes = "café".as_bytes();
        let (head, tail) = bytes.split_at(bytes.len() - 1);

        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(head).as_deref(), Some("caf"));
        assert_eq!(chunker.push(tail).as_deref(), Some("é"));
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn test_chunker_replaces_invalid_bytes() {
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(b"a\xffb").as_deref(), Some("a\u{fffd}b"));
    }

    #[test]
    fn test_chunker_finish_flushes_truncated_tail() {
        let mut chunker = Utf8Chunker::default();
        assert_eq!(chunker.push(&[0xe2, 0x82]), None);
        assert_eq!(chunker.finish().as_deref(), Some("\u{fffd}"));
    }

    #[tokio::test]
    async fn test_sink_appends_newline() {
        let (channel, mut transport) = ClientChannel::pair(4);
        let sink = OutputSink::new(channel.outbound.clone());

        sink.send_line("hello").await.unwrap();
        sink.send_line("already\n").await.unwrap();

        assert_eq!(
            transport.outbound.recv().await,
            Some(Frame::Text("hello\n".into()))
        );
        assert_eq!(
            transport.outbound.recv().await,
            Some(Frame::Text("already\n".into()))
        );
    }

    #[tokio::test]
    async fn test_sink_reports_closed_client() {
        let (channel, transport) = ClientChannel::pair(4);
        let sink = OutputSink::new(channel.outbound.clone());
        drop(transport);

        assert!(sink.send_line("lost").await.is_err());
    }
}
