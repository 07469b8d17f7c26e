//! Inbound dispatch for the membership service.

use super::service::Membership;
use crate::net::message::ops;
use crate::net::Envelope;
use std::sync::Arc;

/// Routes one unsolicited message to the matching membership handler. A
/// handler never lets a failure escape across the transport boundary.
pub async fn handle(service: Arc<Membership>, env: Envelope) {
    match env.msg.operation.as_str() {
        ops::JOIN => service.handle_join(env).await,
        ops::JOIN_PRED => service.handle_join_pred(env).await,
        ops::LEAVE => service.handle_leave(env).await,
        ops::LEAVE_PRED => service.handle_leave_pred(env).await,
        other => {
            tracing::debug!("Membership service dropping unknown operation {:?}", other);
        }
    }
}
