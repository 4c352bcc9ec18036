/// Hourly rate aggregation from live ticks
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::data::HourlyAverageRepository;
use crate::error::{Result, StreamError};
use crate::events::UpdateNotifier;
use crate::types::{HourlyAverage, PairState, RateUpdateMessage, Tick};
use crate::utils::time::{normalize_to_utc, truncate_to_hour};

/// In-memory aggregation state for a single pair
#[derive(Debug, Clone, Default)]
struct PairRuntimeState {
    last_price: Option<f64>,
    last_update: Option<DateTime<Utc>>,

    // Current hour bucket
    hour_start: Option<DateTime<Utc>>,
    sum_prices: f64,
    count: u64,
    hourly_avg: Option<f64>,
}

impl PairRuntimeState {
    fn start_bucket(&mut self, hour_start: DateTime<Utc>, price: f64) {
        self.hour_start = Some(hour_start);
        self.sum_prices = price;
        self.count = 1;
        self.hourly_avg = Some(price);
    }

    fn fold(&mut self, price: f64) {
        self.sum_prices += price;
        self.count += 1;
        self.hourly_avg = Some(self.sum_prices / self.count as f64);
    }

    /// The open bucket as a finalized row, if it holds anything
    fn completed(&self, pair: &str) -> Option<HourlyAverage> {
        match (self.hour_start, self.hourly_avg) {
            (Some(hour_start), Some(avg_price)) if self.count > 0 => Some(HourlyAverage {
                pair: pair.to_string(),
                hour_start,
                avg_price,
                count: self.count,
            }),
            _ => None,
        }
    }

    fn to_public(&self, pair: &str) -> PairState {
        PairState {
            pair: pair.to_string(),
            price: self.last_price,
            hourly_avg: self.hourly_avg,
            last_update: self.last_update,
        }
    }

    fn to_update(&self, pair: &str) -> Option<RateUpdateMessage> {
        let price = self.last_price?;
        let last_update = self.last_update?;

        Some(RateUpdateMessage {
            pair: pair.to_string(),
            price,
            hourly_avg: self.hourly_avg.unwrap_or(price),
            last_update,
        })
    }
}

/// Per-pair running hourly averages.
///
/// Each pair is guarded by its own lock. A rollover saves the closed hour
/// while holding that pair's lock, so readers never see the new hour before
/// the old one is stored. Notification runs after the lock is released.
pub struct RatesAggregator {
    pairs: Vec<String>,
    states: HashMap<String, RwLock<PairRuntimeState>>,
    repo: Arc<dyn HourlyAverageRepository>,
    notifier: RwLock<Option<Arc<dyn UpdateNotifier>>>,
    dropped_ticks: AtomicU64,
    persist_failures: AtomicU64,
}

impl RatesAggregator {
    pub fn new(repo: Arc<dyn HourlyAverageRepository>, pairs: Vec<String>) -> Self {
        let states = pairs
            .iter()
            .map(|pair| (pair.clone(), RwLock::new(PairRuntimeState::default())))
            .collect();

        RatesAggregator {
            pairs,
            states,
            repo,
            notifier: RwLock::new(None),
            dropped_ticks: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
        }
    }

    /// Register the single downstream consumer of updates
    pub async fn set_update_callback(&self, notifier: Arc<dyn UpdateNotifier>) {
        let mut current = self.notifier.write().await;
        *current = Some(notifier);
    }

    pub fn supported_pairs(&self) -> &[String] {
        &self.pairs
    }

    pub fn dropped_ticks(&self) -> u64 {
        self.dropped_ticks.load(Ordering::Relaxed)
    }

    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    /// Hydrate from the latest persisted bucket per pair.
    ///
    /// Last price and last update stay empty until a live tick arrives.
    /// Must not run concurrently with `ingest`.
    pub async fn load_initial_state(&self, rows: Vec<HourlyAverage>) -> usize {
        let mut loaded = 0;

        for row in rows {
            let Some(state) = self.states.get(&row.pair) else {
                debug!("Ignoring stored average for unknown pair {}", row.pair);
                continue;
            };

            let mut state = state.write().await;
            state.hour_start = Some(row.hour_start);
            state.hourly_avg = Some(row.avg_price);
            state.count = row.count;
            state.sum_prices = row.avg_price * row.count as f64;
            loaded += 1;
        }

        loaded
    }

    /// Fetch the latest buckets from the repository and hydrate
    pub async fn load_initial_averages(&self) -> Result<usize> {
        let rows = self.repo.get_latest_for_pairs(&self.pairs).await?;
        let loaded = self.load_initial_state(rows).await;
        info!("Loaded initial hourly averages for {} pairs", loaded);
        Ok(loaded)
    }

    /// Pair state for a tick worth folding
    fn accept(&self, tick: &Tick) -> Result<&RwLock<PairRuntimeState>> {
        let state = self
            .states
            .get(&tick.pair)
            .ok_or_else(|| StreamError::UnknownPair(tick.pair.clone()))?;

        if !tick.price.is_finite() || tick.price <= 0.0 {
            return Err(StreamError::InvalidTick(format!(
                "unusable price {} for {}",
                tick.price, tick.pair
            )));
        }

        Ok(state)
    }

    /// Fold one tick into its pair's state.
    ///
    /// Returns false when the tick was dropped (unknown pair or unusable
    /// price).
    pub async fn ingest(&self, tick: Tick) -> bool {
        let state = match self.accept(&tick) {
            Ok(state) => state,
            Err(e) => {
                self.dropped_ticks.fetch_add(1, Ordering::Relaxed);
                match e {
                    StreamError::UnknownPair(_) => debug!("Dropping tick: {} ({})", e, e.error_code()),
                    _ => warn!("Dropping tick: {} ({})", e, e.error_code()),
                }
                return false;
            }
        };

        let timestamp = normalize_to_utc(tick.timestamp);
        let hour_start = truncate_to_hour(timestamp);

        let update = {
            let mut state = state.write().await;

            match state.hour_start {
                None => state.start_bucket(hour_start, tick.price),
                Some(current) if current == hour_start => state.fold(tick.price),
                Some(current) => {
                    if hour_start < current {
                        warn!(
                            "Out-of-order tick for {}: bucket {} is before open bucket {}",
                            tick.pair, hour_start, current
                        );
                    }
                    // Closed hour is saved before the new one becomes visible
                    if let Some(bucket) = state.completed(&tick.pair) {
                        self.persist(bucket).await;
                    }
                    state.start_bucket(hour_start, tick.price);
                }
            }

            state.last_price = Some(tick.price);
            state.last_update = Some(timestamp);

            state.to_update(&tick.pair)
        };

        if let Some(update) = update {
            self.emit(update).await;
        }

        true
    }

    async fn persist(&self, bucket: HourlyAverage) {
        match self
            .repo
            .save(&bucket.pair, bucket.hour_start, bucket.avg_price, bucket.count)
            .await
        {
            Ok(()) => {
                info!(
                    "Hour closed: {} @ {} avg={:.6} count={}",
                    bucket.pair, bucket.hour_start, bucket.avg_price, bucket.count
                );
            }
            Err(e) => {
                self.persist_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Failed to persist hourly average {} @ {}: {} ({})",
                    bucket.pair,
                    bucket.hour_start,
                    e,
                    e.error_code()
                );
            }
        }
    }

    async fn emit(&self, update: RateUpdateMessage) {
        let notifier = {
            let current = self.notifier.read().await;
            current.clone()
        };

        if let Some(notifier) = notifier {
            notifier.notify(update).await;
        }
    }

    /// Public state of every configured pair, in configuration order
    pub async fn snapshot(&self) -> Vec<PairState> {
        let mut snapshot = Vec::with_capacity(self.pairs.len());

        for pair in &self.pairs {
            if let Some(state) = self.states.get(pair) {
                snapshot.push(state.read().await.to_public(pair));
            }
        }

        snapshot
    }

    pub async fn pair_state(&self, pair: &str) -> Option<PairState> {
        let state = self.states.get(pair)?;
        let state = state.read().await;
        Some(state.to_public(pair))
    }
}
