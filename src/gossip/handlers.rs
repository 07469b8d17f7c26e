//! Inbound dispatch for the gossip service.

use super::service::Gossip;
use crate::net::message::ops;
use crate::net::Envelope;
use std::sync::Arc;

/// Routes one unsolicited message to the gossip handler.
pub async fn handle(service: Arc<Gossip>, env: Envelope) {
    match env.msg.operation.as_str() {
        ops::ALIVE => service.handle_alive(env).await,
        other => {
            tracing::debug!("Gossip service dropping unknown operation {:?}", other);
        }
    }
}
