pub mod backoff;
pub mod finnhub;

pub use backoff::ReconnectBackoff;
pub use finnhub::{FeedConnectionState, FeedStats, FeedStatsSnapshot, FeedStopHandle, FinnhubClient};
