//! The socket seam the peer logic runs over.
//!
//! Frames are newline-delimited JSON over any byte stream; the TCP
//! implementation owns a writer task fed by an unbounded queue and a reader
//! task that parses lines into frames. [`MemorySocket`] is the in-process
//! implementation used by tests and single-process setups.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

/// One side of a message-oriented socket: send a frame, close, identify.
pub trait SocketHandle: Send + Sync + 'static {
    /// The socket id assigned by the transport.
    fn id(&self) -> &str;
    /// Queues one frame for delivery; `false` once the socket is gone.
    fn send(&self, frame: Value) -> bool;
    /// Commands the socket to disconnect.
    fn close(&self);
}

enum WriterCommand {
    Frame(Value),
    Close,
}

/// A TCP socket speaking newline-delimited JSON frames.
pub struct TcpSocket {
    id: String,
    writer: mpsc::UnboundedSender<WriterCommand>,
}

impl SocketHandle for TcpSocket {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, frame: Value) -> bool {
        self.writer.send(WriterCommand::Frame(frame)).is_ok()
    }

    fn close(&self) {
        let _ = self.writer.send(WriterCommand::Close);
    }
}

/// Splits a TCP stream into a socket handle plus the inbound frame stream,
/// spawning the reader and writer tasks.
pub fn tcp_socket(
    id: impl Into<String>,
    stream: TcpStream,
) -> (Arc<TcpSocket>, mpsc::UnboundedReceiver<Value>) {
    let id = id.into();
    let (read_half, write_half) = stream.into_split();

    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    tokio::spawn(writer_task(write_half, writer_rx));

    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    tokio::spawn(reader_task(read_half, frames_tx));

    (Arc::new(TcpSocket { id, writer: writer_tx }), frames_rx)
}

async fn writer_task(
    mut writer: OwnedWriteHalf,
    mut commands: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = commands.recv().await {
        let frame = match command {
            WriterCommand::Frame(frame) => frame,
            WriterCommand::Close => break,
        };
        let line = frame.to_string();
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if writer.write_all(b"\n").await.is_err() {
            break;
        }
        let _ = writer.flush().await;
    }

    let _ = writer.shutdown().await;
}

async fn reader_task(read_half: OwnedReadHalf, frames: mpsc::UnboundedSender<Value>) {
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(frame) => {
                if frames.send(frame).is_err() {
                    break;
                }
            }
            Err(error) => {
                warn!("failed to parse inbound line as JSON: {error}");
            }
        }
    }
    // Dropping `frames` lets the peer pump observe the disconnect.
}

/// An in-process socket: outbound frames land on a channel the test (or
/// embedding process) drains, and `close` fires a one-shot the other side
/// can wire to its disconnect path.
pub struct MemorySocket {
    id: String,
    outbound: mpsc::UnboundedSender<Value>,
    closer: Mutex<Option<oneshot::Sender<()>>>,
}

impl SocketHandle for MemorySocket {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, frame: Value) -> bool {
        self.outbound.send(frame).is_ok()
    }

    fn close(&self) {
        match self.closer.lock().take() {
            Some(closer) => {
                let _ = closer.send(());
            }
            None => debug!("memory socket {} already closed", self.id),
        }
    }
}

/// Builds a memory socket: the handle, the stream of frames it sends, and
/// the close signal.
pub fn memory_socket(
    id: impl Into<String>,
) -> (
    Arc<MemorySocket>,
    mpsc::UnboundedReceiver<Value>,
    oneshot::Receiver<()>,
) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (closer_tx, closer_rx) = oneshot::channel();
    (
        Arc::new(MemorySocket {
            id: id.into(),
            outbound: outbound_tx,
            closer: Mutex::new(Some(closer_tx)),
        }),
        outbound_rx,
        closer_rx,
    )
}
