use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::api::ApiClient;

/// Background task applying sibling-tab messages to a client.
pub struct CrossTabSync;

impl CrossTabSync {
    /// Start listening on the client's channel.
    ///
    /// The subscription is taken before this returns, so messages published
    /// afterwards are never missed. Must be called within a Tokio runtime.
    pub fn spawn(client: &ApiClient) -> JoinHandle<()> {
        let mut messages = client.store().channel().subscribe();
        let client = client.clone();

        tokio::spawn(async move {
            while let Some(message) = messages.next().await {
                debug!(?message, "Cross-tab message received");
                client.apply_cross_tab(message);
            }
            debug!("Cross-tab channel closed");
        })
    }
}
