//! Transport abstraction.
//!
//! A [`Connector`] opens a [`TransportLink`]: an outgoing channel of text
//! frames and an incoming stream of [`TransportEvent`]s. The client never
//! touches sockets directly.
//!
//! ```text
//!  Core ──outgoing──► writer task ──► WebSocket sink
//!  Core ◄──incoming── reader task ◄── WebSocket stream
//! ```
//!
//! Dropping the outgoing sender closes the socket.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{RapidError, Result};
use crate::protocol::{Envelope, ServerMessage};

const INCOMING_CAPACITY: usize = 256;

/// What the reader task reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A text frame
    Message(String),
    /// The peer closed the connection, with its reason if any
    Closed(Option<String>),
    /// The connection failed
    Error(String),
}

/// An open transport.
#[derive(Debug)]
pub struct TransportLink {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::Receiver<TransportEvent>,
}

/// Opens transports to an endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<TransportLink>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<TransportLink> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(endpoint)
            .await
            .map_err(|e| RapidError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(INCOMING_CAPACITY);

        // Writer task: forward outgoing frames until the client lets go
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader task: surface text frames and the end of the stream
        tokio::spawn(async move {
            let last = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(TransportEvent::Message(text.as_str().to_owned())).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            if in_tx.send(TransportEvent::Message(text)).await.is_err() {
                                return;
                            }
                        }
                        Err(_) => log::warn!("Dropping non-UTF-8 binary frame ({} bytes)", data.len()),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break TransportEvent::Closed(frame.map(|f| f.reason.as_str().to_owned()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break TransportEvent::Error(e.to_string()),
                    None => break TransportEvent::Closed(None),
                }
            };
            let _ = in_tx.send(last).await;
        });

        log::debug!("WebSocket open to {endpoint}");
        Ok(TransportLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// In-memory transport; every `connect` hands a [`ChannelPeer`] to the
/// receiver returned by [`ChannelConnector::new`].
#[derive(Debug, Clone)]
pub struct ChannelConnector {
    peers: mpsc::UnboundedSender<ChannelPeer>,
}

impl ChannelConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelPeer>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        (Self { peers }, accepted)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, endpoint: &str) -> Result<TransportLink> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INCOMING_CAPACITY);
        let peer = ChannelPeer {
            endpoint: endpoint.to_string(),
            from_client: out_rx,
            to_client: in_tx,
            buffered: VecDeque::new(),
        };
        self.peers
            .send(peer)
            .map_err(|_| RapidError::Transport(format!("nobody accepts connections to {endpoint}")))?;
        Ok(TransportLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

/// Server side of an in-memory transport.
#[derive(Debug)]
pub struct ChannelPeer {
    pub endpoint: String,
    pub from_client: mpsc::UnboundedReceiver<String>,
    pub to_client: mpsc::Sender<TransportEvent>,
    buffered: VecDeque<Envelope>,
}

impl ChannelPeer {
    /// Next envelope from the client, unpacking batch frames.
    ///
    /// `None` once the client dropped its side.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.buffered.pop_front() {
                return Some(envelope);
            }
            let frame = self.from_client.recv().await?;
            match Envelope::decode_frame(&frame) {
                Ok(envelopes) => self.buffered.extend(envelopes),
                Err(e) => log::warn!("Peer dropped undecodable frame: {e}"),
            }
        }
    }

    pub async fn reply(&self, message: &ServerMessage) -> Result<()> {
        self.send_text(message.encode()?).await
    }

    pub async fn send_text(&self, text: String) -> Result<()> {
        self.to_client
            .send(TransportEvent::Message(text))
            .await
            .map_err(|_| RapidError::ConnectionLost)
    }

    pub async fn close(&self, reason: Option<String>) {
        let _ = self.to_client.send(TransportEvent::Closed(reason)).await;
    }
}
