//! Line-oriented TCP client.

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// What the server did, as seen from this side of the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// One decoded line, terminator stripped.
    Line(String),
    /// The server closed the connection (or the socket failed).
    Disconnected,
}

/// Handle to a running connection. Dropping it closes the socket once the
/// queued output drains.
#[derive(Clone)]
pub struct TalkerClient {
    tx: mpsc::UnboundedSender<String>,
}

impl TalkerClient {
    /// Queue one line for the server; the CRLF terminator is appended on
    /// the wire.
    pub fn send_line(&self, line: &str) -> Result<()> {
        self.tx
            .send(line.to_string())
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }
}

/// Connect to a server, returning a handle plus the stream of events. The
/// receiver yields [`Event::Disconnected`] once and then closes.
pub async fn connect(addr: &str) -> Result<(TalkerClient, mpsc::UnboundedReceiver<Event>)> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let (reader, mut writer) = stream.into_split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(b"\r\n").await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if event_tx.send(Event::Line(line)).is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    let _ = event_tx.send(Event::Disconnected);
                    break;
                }
                Err(error) => {
                    tracing::debug!(%error, "client read failed");
                    let _ = event_tx.send(Event::Disconnected);
                    break;
                }
            }
        }
    });

    Ok((TalkerClient { tx: out_tx }, event_rx))
}
