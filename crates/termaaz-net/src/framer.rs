//! Line framing: one self-contained JSON record per `\n`-terminated
//! line, tolerant of arbitrary fragmentation and coalescing by the
//! underlying transport.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use termaaz_shared::protocol::Envelope;

/// Per-socket receive buffer. Bytes go in, complete envelopes come out;
/// a trailing unterminated fragment is retained and prepended to the
/// next incoming chunk.
#[derive(Debug, Default)]
pub struct Framer {
    buffer: BytesMut,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drain the next complete line and parse it. Lines that fail to
    /// parse are dropped silently; they never abort the connection.
    pub fn next_message(&mut self) -> Option<Envelope> {
        loop {
            let newline = self.buffer.iter().position(|&b| b == b'\n')?;
            let line = self.buffer.split_to(newline + 1);
            // Drop the terminator before parsing.
            let line = &line[..newline];

            match std::str::from_utf8(line).map(Envelope::from_line) {
                Ok(Ok(envelope)) => return Some(envelope),
                Ok(Err(err)) => {
                    debug!(error = %err, "Dropping malformed wire line");
                }
                Err(err) => {
                    debug!(error = %err, "Dropping non-UTF8 wire line");
                }
            }
        }
    }

    /// Bytes currently held back as an incomplete fragment.
    pub fn pending_len(&self) -> usize {
        self.buffer.remaining()
    }
}

/// Control messages a healthy peer drains within a handful of ticks.
const CONTROL_QUEUE: usize = 64;
/// Bulk slots are large (one file chunk each), so the queue stays short.
const BULK_QUEUE: usize = 4;

/// The write side of one peer link. The socket is owned by a dedicated
/// writer task, so callers queue lines instead of awaiting the stream
/// and a stalled peer can never block them. Sending is best-effort: a
/// failure is reported to the caller (which treats it as an implicit
/// disconnect) rather than propagated.
pub struct Connection {
    control: mpsc::Sender<String>,
    bulk: mpsc::Sender<String>,
}

impl Connection {
    pub fn new(writer: Box<dyn AsyncWrite + Send + Sync + Unpin>) -> Self {
        let (control, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (bulk, bulk_rx) = mpsc::channel(BULK_QUEUE);
        tokio::spawn(write_loop(writer, control_rx, bulk_rx));
        Self { control, bulk }
    }

    /// Serialize and queue one envelope. Returns false when the link is
    /// down, or when the queue is full because the peer stopped
    /// draining its socket; either way the peer is effectively gone.
    pub fn send(&self, envelope: &Envelope) -> bool {
        let Some(line) = encode(envelope) else {
            return false;
        };
        match self.control.try_send(line) {
            Ok(()) => true,
            Err(err) => {
                debug!(kind = envelope.payload.kind(), error = %err, "Control queue rejected line");
                false
            }
        }
    }

    /// Handle for streaming bulk data from outside the owning task.
    /// Its sends await queue capacity, pacing the producer to the
    /// peer's actual read speed.
    pub fn bulk_sender(&self) -> BulkSender {
        BulkSender {
            tx: self.bulk.clone(),
        }
    }
}

/// Write handle for one transfer. Holding one keeps the peer's writer
/// task alive, so drop it as soon as the transfer ends.
#[derive(Clone)]
pub struct BulkSender {
    tx: mpsc::Sender<String>,
}

impl BulkSender {
    /// Queue one envelope, waiting for a free slot. Returns false once
    /// the link is down.
    pub async fn send(&self, envelope: &Envelope) -> bool {
        let Some(line) = encode(envelope) else {
            return false;
        };
        self.tx.send(line).await.is_ok()
    }
}

fn encode(envelope: &Envelope) -> Option<String> {
    match envelope.to_line() {
        Ok(line) => Some(line),
        Err(err) => {
            debug!(kind = envelope.payload.kind(), error = %err, "Failed to encode envelope");
            None
        }
    }
}

/// Drains both queues into the socket, control lines first. Exits when
/// the control side closes (the peer was evicted) or a write fails.
async fn write_loop(
    mut writer: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    mut control_rx: mpsc::Receiver<String>,
    mut bulk_rx: mpsc::Receiver<String>,
) {
    loop {
        let line = tokio::select! {
            biased;
            line = control_rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
            line = bulk_rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        if let Err(err) = writer.write_all(line.as_bytes()).await {
            debug!(error = %err, "Write failed");
            break;
        }
        if let Err(err) = writer.flush().await {
            debug!(error = %err, "Flush failed");
            break;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use termaaz_shared::protocol::{ChatPayload, Empty, Payload};
    use termaaz_shared::time::now_millis;
    use termaaz_shared::types::UserId;

    fn chat_line(content: &str) -> String {
        Envelope {
            sender_id: UserId::new("aabbccdd00112233"),
            sender_name: "alice".into(),
            timestamp: now_millis(),
            payload: Payload::Chat(ChatPayload {
                content: content.into(),
                reply_to: None,
                user_color: "#FF6B9D".into(),
            }),
        }
        .to_line()
        .unwrap()
    }

    #[test]
    fn test_fragmented_line_is_reassembled() {
        let mut framer = Framer::new();
        let line = chat_line("hello");
        let (a, b) = line.as_bytes().split_at(7);

        framer.push(a);
        assert!(framer.next_message().is_none());
        assert_eq!(framer.pending_len(), 7);

        framer.push(b);
        let env = framer.next_message().expect("complete line");
        match env.payload {
            Payload::Chat(chat) => assert_eq!(chat.content, "hello"),
            other => panic!("unexpected payload: {}", other.kind()),
        }
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn test_coalesced_lines_come_out_one_by_one() {
        let mut framer = Framer::new();
        let mut bytes = chat_line("one");
        bytes.push_str(&chat_line("two"));
        bytes.push_str(&chat_line("three"));
        framer.push(bytes.as_bytes());

        let mut contents = Vec::new();
        while let Some(env) = framer.next_message() {
            if let Payload::Chat(chat) = env.payload {
                contents.push(chat.content);
            }
        }
        assert_eq!(contents, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_garbage_lines_are_skipped_not_fatal() {
        let mut framer = Framer::new();
        let mut bytes = String::from("{this is not json}\n");
        bytes.push('\n'); // blank line
        bytes.push_str(&chat_line("still alive"));
        bytes.push_str("\u{fffd}\n");
        framer.push(bytes.as_bytes());

        let env = framer.next_message().expect("valid line survives garbage");
        match env.payload {
            Payload::Chat(chat) => assert_eq!(chat.content, "still alive"),
            other => panic!("unexpected payload: {}", other.kind()),
        }
        assert!(framer.next_message().is_none());
    }

    #[tokio::test]
    async fn test_dead_connection_send_reports_false() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);

        let conn = Connection::new(Box::new(client));
        let env = Envelope {
            sender_id: UserId::new("aabbccdd00112233"),
            sender_name: "alice".into(),
            timestamp: now_millis(),
            payload: Payload::Ping(Empty {}),
        };

        // The first line may still be accepted into the queue; once the
        // writer task hits the closed stream, sends start failing.
        conn.send(&env);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!conn.send(&env));
    }

    #[tokio::test]
    async fn test_stalled_connection_does_not_block_sender() {
        // A peer that never reads: writes back up in the tiny stream
        // buffer, then in the queue, and send degrades to false instead
        // of hanging the caller.
        let (client, _server) = tokio::io::duplex(64);
        let conn = Connection::new(Box::new(client));
        let env = Envelope {
            sender_id: UserId::new("aabbccdd00112233"),
            sender_name: "alice".into(),
            timestamp: now_millis(),
            payload: Payload::Ping(Empty {}),
        };

        let verdict = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                if !conn.send(&env) {
                    return;
                }
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(verdict.is_ok(), "send kept accepting lines for a wedged peer");
    }
}
