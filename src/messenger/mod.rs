//! Bidirectional named-message channel between pane and preview.
//!
//! Delivery is at most once per send and FIFO per direction. Sending to a
//! torn-down peer is a silent no-op. Handlers run on the receiving
//! endpoint's pump task, in arrival order, and must not block.

pub mod bridge;
pub mod contract;

pub use bridge::run_line_bridge;
pub use contract::{Envelope, MessageKind};

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handler for one message kind.
pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// Handler receiving every message.
pub type AnyHandler = Arc<dyn Fn(MessageKind, Value) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    by_kind: HashMap<MessageKind, Vec<Handler>>,
    any: Vec<AnyHandler>,
}

/// One endpoint of a message channel.
pub struct Messenger {
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    handlers: Arc<RwLock<Handlers>>,
    seq: AtomicU64,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Messenger {
    /// Create two connected endpoints. Must be called inside a tokio runtime.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::start(a_tx, b_rx), Self::start(b_tx, a_rx))
    }

    fn start(
        outbound: mpsc::UnboundedSender<Envelope>,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Self {
        let handlers: Arc<RwLock<Handlers>> = Arc::default();
        let pump_handlers = Arc::clone(&handlers);
        let pump = tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                dispatch(&pump_handlers, envelope);
            }
            debug!("messenger peer closed; pump stopped");
        });
        Self {
            outbound: Mutex::new(Some(outbound)),
            handlers,
            seq: AtomicU64::new(0),
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Whether the peer endpoint is still accepting messages.
    pub fn is_live(&self) -> bool {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Send a message. Returns `false` when the peer is gone and the message
    /// was dropped.
    pub fn send(&self, kind: MessageKind, payload: Value) -> bool {
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = outbound.as_ref().filter(|tx| !tx.is_closed()) else {
            debug!(kind = %kind, "messenger target is gone; dropping message");
            return false;
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        tx.send(Envelope::new(seq, kind, payload)).is_ok()
    }

    /// Serialize and send a typed payload.
    pub fn send_json<T: Serialize>(&self, kind: MessageKind, payload: &T) -> bool {
        match serde_json::to_value(payload) {
            Ok(value) => self.send(kind, value),
            Err(e) => {
                warn!(kind = %kind, error = %e, "failed to serialize message payload");
                false
            }
        }
    }

    /// Register a handler for one message kind.
    pub fn bind(&self, kind: MessageKind, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .by_kind
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register a handler receiving every message.
    pub fn bind_all(&self, handler: impl Fn(MessageKind, Value) + Send + Sync + 'static) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .any
            .push(Arc::new(handler));
    }

    /// Tear down this endpoint. The peer observes it as dead.
    pub fn close(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(pump) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pump.abort();
        }
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.close();
    }
}

fn dispatch(handlers: &RwLock<Handlers>, envelope: Envelope) {
    let (specific, any) = {
        let handlers = handlers.read().unwrap_or_else(|e| e.into_inner());
        (
            handlers
                .by_kind
                .get(&envelope.kind)
                .cloned()
                .unwrap_or_default(),
            handlers.any.clone(),
        )
    };
    if specific.is_empty() && any.is_empty() {
        debug!(kind = %envelope.kind, "no handler bound; message ignored");
        return;
    }
    for handler in specific {
        handler(envelope.payload.clone());
    }
    for handler in any {
        handler(envelope.kind, envelope.payload.clone());
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_in_order() {
        let (pane, preview) = Messenger::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        preview.bind(MessageKind::Setting, move |payload| {
            let _ = tx.send(payload);
        });
        for i in 0..5 {
            assert!(pane.send(MessageKind::Setting, json!(i)));
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), json!(i));
        }
    }

    #[tokio::test]
    async fn unbound_kinds_are_ignored() {
        let (pane, preview) = Messenger::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        preview.bind(MessageKind::Ready, move |_| {
            let _ = tx.send(());
        });
        assert!(pane.send(MessageKind::Transports, json!({})));
        assert!(pane.send(MessageKind::Ready, Value::Null));
        rx.recv().await.unwrap();
    }

    #[tokio::test]
    async fn sending_to_dead_peer_is_silent() {
        let (pane, preview) = Messenger::pair();
        drop(preview);
        for _ in 0..10 {
            if !pane.is_live() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!pane.is_live());
        assert!(!pane.send(MessageKind::Ready, Value::Null));
    }

    #[tokio::test]
    async fn closed_endpoint_cannot_send() {
        let (pane, _preview) = Messenger::pair();
        pane.close();
        assert!(!pane.send(MessageKind::Ready, Value::Null));
    }
}
