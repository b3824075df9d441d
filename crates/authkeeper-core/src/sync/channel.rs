use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

/// Buffer size for the in-process hub.
/// Messages are rare (one per login, renewal or logout), 64 leaves ample headroom.
const HUB_CAPACITY: usize = 64;

/// Message exchanged between sibling tabs.
///
/// Wire shape: `{"kind":"token","value":"<jwt>"}` or `{"kind":"logout"}`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrossTabMessage {
    Token { value: String },
    Logout,
}

impl fmt::Debug for CrossTabMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrossTabMessage::Token { .. } => f.write_str("Token { value: <redacted> }"),
            CrossTabMessage::Logout => f.write_str("Logout"),
        }
    }
}

/// Publish/subscribe transport between tabs of the same application.
///
/// Delivery is fire-and-forget and at-most-once. An endpoint never receives
/// the messages it published itself.
pub trait TabChannel: Send + Sync {
    fn publish(&self, message: CrossTabMessage);

    fn subscribe(&self) -> BoxStream<'static, CrossTabMessage>;
}

/// Channel for a client with no siblings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullChannel;

impl TabChannel for NullChannel {
    fn publish(&self, _message: CrossTabMessage) {}

    fn subscribe(&self) -> BoxStream<'static, CrossTabMessage> {
        stream::pending().boxed()
    }
}

#[derive(Debug, Clone)]
struct Envelope {
    origin: u64,
    message: CrossTabMessage,
}

/// In-process hub connecting any number of tabs.
#[derive(Debug)]
pub struct LocalHub {
    tx: broadcast::Sender<Envelope>,
    next_id: AtomicU64,
}

impl LocalHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Create an endpoint for a new tab.
    pub fn join(&self) -> LocalChannel {
        LocalChannel {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tx: self.tx.clone(),
        }
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One tab's endpoint on a [`LocalHub`].
#[derive(Debug, Clone)]
pub struct LocalChannel {
    id: u64,
    tx: broadcast::Sender<Envelope>,
}

impl TabChannel for LocalChannel {
    fn publish(&self, message: CrossTabMessage) {
        // No receivers is not an error: there may be no other tabs open
        let _ = self.tx.send(Envelope {
            origin: self.id,
            message,
        });
    }

    fn subscribe(&self) -> BoxStream<'static, CrossTabMessage> {
        let own_id = self.id;
        let rx = self.tx.subscribe();

        stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) if envelope.origin == own_id => continue,
                    Ok(envelope) => return Some((envelope.message, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Cross-tab receiver lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}
