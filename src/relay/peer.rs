//! # Audio Peer Link
//!
//! Outbound WebSocket connection to the generative-audio service.
//!
//! The socket is split on connect:
//! - the read half is returned as an [`AudioPeerStream`] so the call actor can
//!   attach it with `ctx.add_stream` and receive frames in its own mailbox
//! - the write half is owned by a spawned writer task fed through an unbounded
//!   channel, so sending never blocks the actor
//!
//! Dropping the last sender ends the writer task, which closes the socket with
//! a close frame.

use crate::error::RelayError;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Read half of the audio peer socket.
pub type AudioPeerStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Write handle for the audio peer socket.
#[derive(Debug)]
pub struct AudioPeerLink {
    tx: Option<mpsc::UnboundedSender<Message>>,
}

impl AudioPeerLink {
    /// Queue a text frame for sending.
    pub fn send_text(&self, text: String) -> Result<(), RelayError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| RelayError::Transport("audio peer link is closed".to_string()))?;

        tx.send(Message::Text(text))
            .map_err(|_| RelayError::Transport("audio peer writer has stopped".to_string()))
    }

    /// Close the connection once queued frames are written. Idempotent.
    pub fn close(&mut self) {
        if self.tx.take().is_some() {
            debug!("Closing audio peer link");
        }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

/// Open the connection to `url` and start the writer task.
///
/// `url` may carry an API key in its query string, so it is never logged.
pub async fn connect(url: &str) -> Result<(AudioPeerLink, AudioPeerStream), RelayError> {
    let (socket, response) = connect_async(url).await?;
    debug!(status = %response.status(), "Audio peer WebSocket handshake complete");

    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    tokio::spawn(async move {
        if let Err(e) = UnboundedReceiverStream::new(rx).map(Ok::<_, WsError>).forward(sink).await {
            warn!(error = %e, "Audio peer writer stopped");
        }
    });

    Ok((AudioPeerLink { tx: Some(tx) }, stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_link_sends_receives_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let first = ws.next().await.unwrap().unwrap();
            assert_eq!(first, Message::Text("hello".to_string()));
            ws.send(Message::Text("world".to_string())).await.unwrap();

            // The client closes after its queued frames are flushed
            let mut saw_close = false;
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    saw_close = true;
                    break;
                }
            }
            saw_close
        });

        let (mut link, mut stream) = connect(&format!("ws://{}", addr)).await.unwrap();
        assert!(link.is_open());
        link.send_text("hello".to_string()).unwrap();

        let reply = stream.next().await.unwrap().unwrap();
        assert_eq!(reply, Message::Text("world".to_string()));

        link.close();
        link.close();
        assert!(!link.is_open());
        assert!(link.send_text("late".to_string()).is_err());

        assert!(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_connect_failure_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect(&format!("ws://{}", addr)).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
