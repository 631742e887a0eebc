//! Delivery collaborator — how job results and queue notifications reach
//! end users on their platforms.

use async_trait::async_trait;
use tracing::debug;

use crate::error::DeliveryError;

/// Per-platform message delivery.
///
/// The kernel treats this as an injected capability and tolerates its
/// failures silently: a lost notification never fails a job or a task.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Deliver a text message to a channel.
    async fn send(&self, platform: &str, channel_id: &str, text: &str) -> Result<(), DeliveryError>;

    /// Best-effort liveness indicator (a platform "typing" signal).
    async fn send_typing(&self, _platform: &str, _channel_id: &str) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// Prints deliveries to stdout, standing in for real platform transports.
pub struct ConsoleDelivery;

#[async_trait]
impl Delivery for ConsoleDelivery {
    async fn send(&self, platform: &str, channel_id: &str, text: &str) -> Result<(), DeliveryError> {
        println!("[{platform}/{channel_id}] {text}");
        Ok(())
    }

    async fn send_typing(&self, platform: &str, channel_id: &str) -> Result<(), DeliveryError> {
        debug!(platform = %platform, channel = %channel_id, "typing");
        Ok(())
    }
}
