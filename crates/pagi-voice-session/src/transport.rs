//! Duplex channel to the conversational agent.
//!
//! The session sees a [`DuplexChannel`] that is created immediately and reports
//! its lifecycle (open, message, close, error) through the event sink, matching
//! how a browser WebSocket behaves. [`WsConnector`] implements this with
//! tokio-tungstenite on a background task.

use crate::error::{VoiceError, VoiceResult};
use crate::events::{EventSink, SessionEvent};
use crate::protocol::ClientMessage;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Graceful close
pub const CLOSE_NORMAL: u16 = 1000;
/// Connection dropped without a close frame
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Close frame without a status code
pub const CLOSE_NO_STATUS: u16 = 1005;

/// Sending half of an open (or opening) connection
pub trait DuplexChannel {
    fn send(&mut self, message: &ClientMessage) -> VoiceResult<()>;

    /// Start a close handshake. Idempotent.
    fn close(&mut self, code: u16, reason: &str);

    /// Handshake completed and not yet closed
    fn is_open(&self) -> bool;
}

/// Opens channels; lifecycle events go to `sink`
pub trait Connector {
    fn open(&mut self, url: &str, sink: EventSink) -> VoiceResult<Box<dyn DuplexChannel>>;
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close(u16, String),
}

/// WebSocket client built on tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    fn open(&mut self, url: &str, sink: EventSink) -> VoiceResult<Box<dyn DuplexChannel>> {
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(VoiceError::Transport(format!(
                "unsupported endpoint '{}': expected ws:// or wss://",
                url
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VoiceError::Transport(format!("no async runtime for socket: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        runtime.spawn(run_socket(url.to_string(), sink, rx, Arc::clone(&open)));

        info!("🔌 Connecting to {}", url);
        Ok(Box::new(WsChannel {
            tx,
            open,
            closing: false,
        }))
    }
}

/// Handle to a tungstenite connection task
pub struct WsChannel {
    tx: mpsc::UnboundedSender<Outbound>,
    open: Arc<AtomicBool>,
    closing: bool,
}

impl DuplexChannel for WsChannel {
    fn send(&mut self, message: &ClientMessage) -> VoiceResult<()> {
        if self.closing {
            return Err(VoiceError::Transport("channel is closing".to_string()));
        }
        let json = message.to_json()?;
        self.tx
            .send(Outbound::Text(json))
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }

    fn close(&mut self, code: u16, reason: &str) {
        if self.closing {
            return;
        }
        self.closing = true;
        if self.tx.send(Outbound::Close(code, reason.to_string())).is_err() {
            debug!("Socket task already finished");
        }
    }

    fn is_open(&self) -> bool {
        !self.closing && self.open.load(Ordering::SeqCst)
    }
}

async fn run_socket(
    url: String,
    sink: EventSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    open: Arc<AtomicBool>,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("WebSocket connect to {} failed: {}", url, e);
            sink.emit(SessionEvent::SocketError(e.to_string()));
            sink.emit(SessionEvent::SocketClosed {
                code: CLOSE_ABNORMAL,
                reason: e.to_string(),
            });
            return;
        }
    };

    open.store(true, Ordering::SeqCst);
    sink.emit(SessionEvent::SocketOpened);

    let (mut write, mut read) = stream.split();
    let mut close_sent = false;

    loop {
        tokio::select! {
            out = outbound.recv(), if !close_sent => match out {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = write.send(Message::Text(text)).await {
                        warn!("WebSocket send failed: {}", e);
                        sink.emit(SessionEvent::SocketError(e.to_string()));
                        break;
                    }
                }
                Some(Outbound::Close(code, reason)) => {
                    close_sent = true;
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        debug!("Close frame not delivered: {}", e);
                        sink.emit(SessionEvent::SocketClosed { code, reason: String::new() });
                        break;
                    }
                }
                None => {
                    // Session dropped the channel without closing it
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!("Close frame not delivered: {}", e);
                    }
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    sink.emit(SessionEvent::SocketMessage(text.to_string()));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    info!("WebSocket closed ({}): {}", code, reason);
                    sink.emit(SessionEvent::SocketClosed { code, reason });
                    break;
                }
                Some(Ok(other)) => {
                    debug!("Ignoring non-text frame ({} bytes)", other.len());
                }
                Some(Err(e)) => {
                    warn!("WebSocket error: {}", e);
                    sink.emit(SessionEvent::SocketError(e.to_string()));
                    sink.emit(SessionEvent::SocketClosed {
                        code: CLOSE_ABNORMAL,
                        reason: e.to_string(),
                    });
                    break;
                }
                None => {
                    sink.emit(SessionEvent::SocketClosed {
                        code: CLOSE_ABNORMAL,
                        reason: "stream ended".to_string(),
                    });
                    break;
                }
            }
        }
    }

    open.store(false, Ordering::SeqCst);
    debug!("Socket task for {} finished", url);
}
