//! Inbound dispatch for the lookup service.

use super::service::Lookup;
use crate::net::message::ops;
use crate::net::Envelope;
use std::sync::Arc;

/// Routes one unsolicited message to the matching lookup handler. Unknown
/// operations are dropped; a handler never lets a failure escape across the
/// transport boundary.
pub async fn handle(service: Arc<Lookup>, env: Envelope) {
    match env.msg.operation.as_str() {
        ops::INDEX => service.handle_index(env).await,
        ops::TABLE => service.handle_table(env).await,
        other => {
            tracing::debug!("Lookup service dropping unknown operation {:?}", other);
        }
    }
}
