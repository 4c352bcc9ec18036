/// Hourly average storage - repository port plus in-memory and JSONL backends
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::types::HourlyAverage;

type BucketKey = (String, DateTime<Utc>);

/// Abstraction for persisting and querying hourly averages
#[async_trait]
pub trait HourlyAverageRepository: Send + Sync {
    /// Insert or overwrite the row for (pair, hour_start)
    async fn save(
        &self,
        pair: &str,
        hour_start: DateTime<Utc>,
        avg_price: f64,
        count: u64,
    ) -> Result<()>;

    /// Most recent bucket for each of `pairs` that has one
    async fn get_latest_for_pairs(&self, pairs: &[String]) -> Result<Vec<HourlyAverage>>;
}

fn latest_per_pair<'a>(
    rows: impl Iterator<Item = &'a HourlyAverage>,
    pairs: &[String],
) -> Vec<HourlyAverage> {
    let mut latest: HashMap<&str, &HourlyAverage> = HashMap::new();

    for row in rows {
        if !pairs.iter().any(|p| p == &row.pair) {
            continue;
        }
        let newer = latest
            .get(row.pair.as_str())
            .map_or(true, |current| row.hour_start > current.hour_start);
        if newer {
            latest.insert(row.pair.as_str(), row);
        }
    }

    // Keep the caller's pair order
    pairs
        .iter()
        .filter_map(|p| latest.get(p.as_str()).map(|row| (*row).clone()))
        .collect()
}

/// Volatile store, used in tests and when no storage path is wanted
pub struct InMemoryHourlyStore {
    rows: RwLock<HashMap<BucketKey, HourlyAverage>>,
}

impl InMemoryHourlyStore {
    pub fn new() -> Self {
        InMemoryHourlyStore {
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    pub async fn get(&self, pair: &str, hour_start: DateTime<Utc>) -> Option<HourlyAverage> {
        let rows = self.rows.read().await;
        rows.get(&(pair.to_string(), hour_start)).cloned()
    }
}

impl Default for InMemoryHourlyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HourlyAverageRepository for InMemoryHourlyStore {
    async fn save(
        &self,
        pair: &str,
        hour_start: DateTime<Utc>,
        avg_price: f64,
        count: u64,
    ) -> Result<()> {
        let row = HourlyAverage {
            pair: pair.to_string(),
            hour_start,
            avg_price,
            count,
        };
        let mut rows = self.rows.write().await;
        rows.insert((row.pair.clone(), hour_start), row);
        Ok(())
    }

    async fn get_latest_for_pairs(&self, pairs: &[String]) -> Result<Vec<HourlyAverage>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.rows.read().await;
        Ok(latest_per_pair(rows.values(), pairs))
    }
}

/// Append-only JSONL file with an in-memory index.
///
/// Every save appends one line; on load later lines win for the same
/// (pair, hour_start), so re-saving a bucket overwrites it.
pub struct JsonlHourlyStore {
    path: PathBuf,
    index: RwLock<HashMap<BucketKey, HourlyAverage>>,
}

impl JsonlHourlyStore {
    /// Open the store, replaying any existing file into the index
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut index = HashMap::new();

        if tokio::fs::try_exists(&path).await? {
            let file = tokio::fs::File::open(&path).await?;
            let mut lines = BufReader::new(file).lines();
            let mut line_no = 0usize;

            while let Some(line) = lines.next_line().await? {
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<HourlyAverage>(&line) {
                    Ok(row) => {
                        index.insert((row.pair.clone(), row.hour_start), row);
                    }
                    Err(e) => {
                        warn!("Skipping bad line {} in {}: {}", line_no, path.display(), e);
                    }
                }
            }
        }

        debug!("Loaded {} hourly averages from {}", index.len(), path.display());

        Ok(JsonlHourlyStore {
            path,
            index: RwLock::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.len()
    }

    /// Rewrite the file with exactly one line per bucket
    pub async fn compact(&self) -> Result<()> {
        let index = self.index.write().await;

        let mut rows: Vec<&HourlyAverage> = index.values().collect();
        rows.sort_by(|a, b| a.pair.cmp(&b.pair).then(a.hour_start.cmp(&b.hour_start)));

        let mut content = String::new();
        for row in rows {
            content.push_str(&serde_json::to_string(row)?);
            content.push('\n');
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Compacted {} to {} rows", self.path.display(), index.len());
        Ok(())
    }

    async fn append_line(&self, row: &HourlyAverage) -> Result<()> {
        let json_line = serde_json::to_string(row)?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .await?;

        // Terminate a line left torn by an earlier failed write
        let mut line = String::with_capacity(json_line.len() + 2);
        if file.metadata().await?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).await?;
            file.read_exact(&mut last).await?;
            if last[0] != b'\n' {
                line.push('\n');
            }
        }
        line.push_str(&json_line);
        line.push('\n');

        file.write_all(line.as_bytes()).await?;
        file.sync_all().await?;

        Ok(())
    }
}

#[async_trait]
impl HourlyAverageRepository for JsonlHourlyStore {
    async fn save(
        &self,
        pair: &str,
        hour_start: DateTime<Utc>,
        avg_price: f64,
        count: u64,
    ) -> Result<()> {
        let row = HourlyAverage {
            pair: pair.to_string(),
            hour_start,
            avg_price,
            count,
        };

        // Hold the index lock so file order matches index order
        let mut index = self.index.write().await;
        self.append_line(&row).await.map_err(|e| {
            StreamError::PersistenceFailed(format!(
                "{} @ {}: {}",
                row.pair, row.hour_start, e
            ))
        })?;
        index.insert((row.pair.clone(), hour_start), row);

        Ok(())
    }

    async fn get_latest_for_pairs(&self, pairs: &[String]) -> Result<Vec<HourlyAverage>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        let index = self.index.read().await;
        Ok(latest_per_pair(index.values(), pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, h, 0, 0).unwrap()
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ratestream_{}_{}.jsonl", name, uuid::Uuid::new_v4()))
    }

    fn pairs() -> Vec<String> {
        vec!["ETH/USDC".to_string(), "ETH/USDT".to_string(), "ETH/BTC".to_string()]
    }

    #[tokio::test]
    async fn test_in_memory_upsert_overwrites() {
        let store = InMemoryHourlyStore::new();

        store.save("ETH/USDC", hour(10), 2050.0, 2).await.unwrap();
        store.save("ETH/USDC", hour(10), 2060.0, 3).await.unwrap();

        assert_eq!(store.len().await, 1);
        let row = store.get("ETH/USDC", hour(10)).await.unwrap();
        assert_eq!(row.avg_price, 2060.0);
        assert_eq!(row.count, 3);
    }

    #[tokio::test]
    async fn test_latest_for_pairs() {
        let store = InMemoryHourlyStore::new();

        store.save("ETH/USDC", hour(9), 1990.0, 5).await.unwrap();
        store.save("ETH/USDC", hour(11), 2010.0, 4).await.unwrap();
        store.save("ETH/USDC", hour(10), 2000.0, 7).await.unwrap();
        store.save("ETH/BTC", hour(8), 0.05, 1).await.unwrap();
        store.save("SOL/USDC", hour(12), 150.0, 1).await.unwrap();

        let latest = store.get_latest_for_pairs(&pairs()).await.unwrap();

        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].pair, "ETH/USDC");
        assert_eq!(latest[0].hour_start, hour(11));
        assert_eq!(latest[1].pair, "ETH/BTC");

        assert!(store.get_latest_for_pairs(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jsonl_store_reloads_last_write() {
        let path = temp_path("reload");

        {
            let store = JsonlHourlyStore::open(&path).await.unwrap();
            store.save("ETH/USDC", hour(10), 2050.0, 2).await.unwrap();
            store.save("ETH/USDC", hour(10), 2075.0, 4).await.unwrap();
            store.save("ETH/USDT", hour(10), 3000.0, 1).await.unwrap();
            assert_eq!(store.len().await, 2);
        }

        let store = JsonlHourlyStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 2);

        let latest = store.get_latest_for_pairs(&pairs()).await.unwrap();
        assert_eq!(latest[0].avg_price, 2075.0);
        assert_eq!(latest[0].count, 4);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_jsonl_store_repairs_torn_last_line() {
        let path = temp_path("torn");

        let good = serde_json::to_string(&HourlyAverage {
            pair: "ETH/USDT".to_string(),
            hour_start: hour(9),
            avg_price: 3000.0,
            count: 5,
        })
        .unwrap();
        std::fs::write(&path, format!("{}\n{{\"pair\":\"ETH/US", good)).unwrap();

        {
            let store = JsonlHourlyStore::open(&path).await.unwrap();
            assert_eq!(store.len().await, 1);
            store.save("ETH/USDC", hour(10), 2050.0, 2).await.unwrap();
        }

        let store = JsonlHourlyStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 2);
        let latest = store.get_latest_for_pairs(&pairs()).await.unwrap();
        assert_eq!(latest[0].pair, "ETH/USDC");
        assert_eq!(latest[0].avg_price, 2050.0);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_jsonl_save_failure_is_persistence_error() {
        let path = temp_path("unwritable");

        let store = JsonlHourlyStore::open(&path).await.unwrap();
        assert_eq!(store.path(), path.as_path());

        // A directory where the file should be cannot be appended to
        std::fs::create_dir(&path).unwrap();

        let err = store.save("ETH/USDC", hour(10), 2050.0, 2).await.unwrap_err();
        assert_eq!(err.error_code(), "STORE_001");
        assert!(err.to_string().contains("ETH/USDC"));
        assert_eq!(store.len().await, 0);

        let _ = std::fs::remove_dir(path);
    }

    #[tokio::test]
    async fn test_jsonl_store_skips_bad_lines_and_compacts() {
        let path = temp_path("compact");

        let good = serde_json::to_string(&HourlyAverage {
            pair: "ETH/BTC".to_string(),
            hour_start: hour(7),
            avg_price: 0.051,
            count: 9,
        })
        .unwrap();
        std::fs::write(&path, format!("{}\nnot json\n{}\n", good, good)).unwrap();

        let store = JsonlHourlyStore::open(&path).await.unwrap();
        assert_eq!(store.len().await, 1);

        store.compact().await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);

        let _ = std::fs::remove_file(path);
    }
}
