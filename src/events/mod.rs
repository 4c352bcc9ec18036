pub mod broadcast_hub;
pub mod notifier;

pub use broadcast_hub::{BroadcastHub, SubscriberHandle, SubscriberId};
pub use notifier::UpdateNotifier;
