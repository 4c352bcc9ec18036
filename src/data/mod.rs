pub mod hourly_store;
pub mod rates_aggregator;

pub use hourly_store::{HourlyAverageRepository, InMemoryHourlyStore, JsonlHourlyStore};
pub use rates_aggregator::RatesAggregator;
