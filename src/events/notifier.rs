/// Update notification port between the aggregator and the fan-out layer
use async_trait::async_trait;

use crate::types::RateUpdateMessage;

/// Receives one update after every successful ingest.
///
/// Delivery is best-effort: implementations swallow their own failures so
/// the aggregator never observes them.
#[async_trait]
pub trait UpdateNotifier: Send + Sync {
    async fn notify(&self, update: RateUpdateMessage);
}
