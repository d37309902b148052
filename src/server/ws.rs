//! WebSocket plumbing for gateway connections.
//!
//! Each socket is split into a reader loop, which feeds text frames to the
//! dispatcher, and a writer task draining an unbounded queue. Sessions only
//! see the queue through [`WsConnection`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::gateway::{Connection, GatewayDispatcher};

const WRITER_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close(u16, String),
}

/// [`Connection`] backed by a socket writer queue.
#[derive(Debug)]
pub struct WsConnection {
    tx: mpsc::UnboundedSender<Outbound>,
    open: AtomicBool,
}

impl WsConnection {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            tx,
            open: AtomicBool::new(true),
        }
    }

    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Connection for WsConnection {
    fn send(&self, text: String) -> Result<(), String> {
        if !self.is_open() {
            return Err("connection closed".to_string());
        }
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| "socket writer stopped".to_string())
    }

    fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(Outbound::Close(code, reason.to_string()));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.tx.is_closed()
    }
}

/// Drive one upgraded gateway socket until either side closes it.
pub async fn serve_socket(socket: WebSocket, dispatcher: Arc<GatewayDispatcher>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let connection = Arc::new(WsConnection::new(tx));

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if sink.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code, reason) => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = sink.send(WsMessage::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let Some(session) = dispatcher.open_session(connection.clone()) else {
        let _ = writer.await;
        return;
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                dispatcher.handle_text(&session, &text);
            }
            Ok(WsMessage::Close(frame)) => {
                log::debug!("Gateway session {} closed by peer: {:?}", session.id(), frame);
                break;
            }
            Ok(WsMessage::Binary(_)) => {
                log::debug!("Ignoring binary frame from session {}", session.id());
                session.touch();
            }
            Ok(_) => session.touch(),
            Err(e) => {
                log::warn!("WebSocket error on session {}: {}", session.id(), e);
                break;
            }
        }
        if session.is_closed() {
            break;
        }
    }

    connection.mark_closed();
    dispatcher.close_session(session.id());
    drop(session);
    drop(connection);
    // In-flight request tasks may still hold the queue open.
    let mut writer = writer;
    if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_is_queued_once_and_blocks_sends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = WsConnection::new(tx);
        conn.send("a".into()).unwrap();
        conn.close(4003, "Authentication failed");
        conn.close(1001, "Server shutdown");
        assert!(conn.send("b".into()).is_err());
        assert!(!conn.is_open());

        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("a".into()));
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close(4003, "Authentication failed".into())
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_writer_reports_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = WsConnection::new(tx);
        drop(rx);
        assert!(!conn.is_open());
        assert!(conn.send("x".into()).is_err());
    }
}
