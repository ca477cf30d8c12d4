//! Save and restore the rolling series and market context across restarts.
//!
//! Storage is a flat key/value namespace. [`FileStorage`] keeps one `<key>.json` per key and
//! writes through a temp file plus rename, so a crash mid-write leaves the previous value.

use crate::shared::error::DashboardError;
use crate::shared::market::MarketState;
use crate::shared::series::SeriesStore;
use crate::shared::types::SamplePoint;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const FLOW_DATA_KEY: &str = "flowData";
pub const MARKET_STATE_KEY: &str = "marketState";

/// Persisted series older than this are discarded on restore
pub const SERIES_MAX_AGE: ChronoDuration = ChronoDuration::hours(6);
/// Persisted market context older than this is discarded on restore
pub const MARKET_MAX_AGE: ChronoDuration = ChronoDuration::hours(12);

/// Key/value string store
pub trait LocalStorage {
    fn get(&self, key: &str) -> Result<Option<String>, DashboardError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), DashboardError>;
    fn remove(&mut self, key: &str) -> Result<(), DashboardError>;
}

impl<T: LocalStorage + ?Sized> LocalStorage for Box<T> {
    fn get(&self, key: &str) -> Result<Option<String>, DashboardError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), DashboardError> {
        (**self).set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), DashboardError> {
        (**self).remove(key)
    }
}

/// One JSON file per key under a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Platform data directory for the dashboard
    pub fn default_dir() -> Result<PathBuf, DashboardError> {
        ProjectDirs::from("com", "optionsflow", "flow-monitor")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| DashboardError::Storage("no home directory for data dir".to_string()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl LocalStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, DashboardError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), DashboardError> {
        fs::create_dir_all(&self.dir)?;
        atomic_write(&self.path_for(key), value.as_bytes())
    }

    fn remove(&mut self, key: &str) -> Result<(), DashboardError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), DashboardError> {
    let dir = path
        .parent()
        .ok_or_else(|| DashboardError::Storage(format!("no parent dir for {path:?}")))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.tmp"));

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        let _ = file.sync_all();
    }

    fs::rename(&tmp, path)?;
    Ok(())
}

/// In-process storage, used when persistence is switched off
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    entries: HashMap<String, String>,
}

impl LocalStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, DashboardError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), DashboardError> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), DashboardError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct PersistedSnapshot {
    timestamps: Vec<DateTime<Utc>>,
    call_flow: Vec<f64>,
    put_flow: Vec<f64>,
    price: Vec<f64>,
    last_update: DateTime<Utc>,
}

impl PersistedSnapshot {
    fn from_store(store: &SeriesStore, now: DateTime<Utc>) -> Self {
        Self {
            timestamps: store.timestamps().iter().copied().collect(),
            call_flow: store.call_flow().iter().copied().collect(),
            put_flow: store.put_flow().iter().copied().collect(),
            price: store.prices().iter().copied().collect(),
            last_update: now,
        }
    }

    fn into_samples(self) -> Result<Vec<SamplePoint>, DashboardError> {
        let n = self.timestamps.len();
        if self.call_flow.len() != n || self.put_flow.len() != n || self.price.len() != n {
            return Err(DashboardError::Decode(format!(
                "unequal series lengths: {} / {} / {} / {}",
                n,
                self.call_flow.len(),
                self.put_flow.len(),
                self.price.len()
            )));
        }

        Ok(self
            .timestamps
            .into_iter()
            .zip(self.call_flow)
            .zip(self.put_flow)
            .zip(self.price)
            .map(|(((timestamp, call), put), price)| SamplePoint::new(timestamp, call, put, price))
            .collect())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct PersistedMarketState {
    state: MarketState,
    last_update: DateTime<Utc>,
}

/// Whatever survived the restore checks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Restored {
    pub series: Option<Vec<SamplePoint>>,
    pub market: Option<MarketState>,
}

pub struct PersistenceBridge<S> {
    storage: S,
}

impl<S: LocalStorage> PersistenceBridge<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Write the series and market context, stamped with `now`
    pub fn save(
        &mut self,
        store: &SeriesStore,
        market: &MarketState,
        now: DateTime<Utc>,
    ) -> Result<(), DashboardError> {
        let snapshot = PersistedSnapshot::from_store(store, now);
        self.storage
            .set(FLOW_DATA_KEY, &serde_json::to_string(&snapshot)?)?;

        let market = PersistedMarketState {
            state: market.clone(),
            last_update: now,
        };
        self.storage
            .set(MARKET_STATE_KEY, &serde_json::to_string(&market)?)?;

        debug!(samples = store.len(), "persisted flow data");
        Ok(())
    }

    /// Load both entries. Stale or malformed entries are removed and come back as `None`.
    pub fn restore(&mut self, now: DateTime<Utc>) -> Restored {
        let series = self
            .load::<PersistedSnapshot>(FLOW_DATA_KEY, now, SERIES_MAX_AGE, |s| s.last_update)
            .and_then(|snapshot| match snapshot.into_samples() {
                Ok(samples) => Some(samples),
                Err(err) => {
                    warn!(%err, "discarding malformed {}", FLOW_DATA_KEY);
                    self.discard(FLOW_DATA_KEY);
                    None
                }
            });

        let market = self
            .load::<PersistedMarketState>(MARKET_STATE_KEY, now, MARKET_MAX_AGE, |m| m.last_update)
            .map(|persisted| persisted.state);

        if let Some(samples) = &series {
            info!(samples = samples.len(), "restored persisted flow data");
        }

        Restored { series, market }
    }

    fn load<T: for<'de> Deserialize<'de>>(
        &mut self,
        key: &str,
        now: DateTime<Utc>,
        max_age: ChronoDuration,
        last_update: impl Fn(&T) -> DateTime<Utc>,
    ) -> Option<T> {
        let raw = match self.storage.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(%err, "failed to read {}", key);
                return None;
            }
        };

        let value = match serde_json::from_str::<T>(&raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "discarding corrupt {}", key);
                self.discard(key);
                return None;
            }
        };

        let age = now - last_update(&value);
        if age >= max_age {
            info!(age_minutes = age.num_minutes(), "discarding stale {}", key);
            self.discard(key);
            return None;
        }

        Some(value)
    }

    fn discard(&mut self, key: &str) {
        if let Err(err) = self.storage.remove(key) {
            warn!(%err, "failed to remove {}", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::series::RetentionPolicy;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap()
    }

    fn filled_store() -> SeriesStore {
        let mut store = SeriesStore::new(RetentionPolicy::MaxSamples(480));
        for i in 0..30 {
            store
                .append(SamplePoint::new(
                    t0() + ChronoDuration::milliseconds(i * 60_123),
                    1.5 + i as f64 * 0.01,
                    0.9 - i as f64 * 0.02,
                    684.12 + i as f64 * 0.05,
                ))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_round_trip_file_storage() {
        let dir = tempfile::tempdir().unwrap();
        let store = filled_store();
        let mut market = MarketState::default();
        market.previous_close = Some(680.0);
        market.update_price(684.12);

        let mut bridge = PersistenceBridge::new(FileStorage::new(dir.path()));
        let saved_at = t0() + ChronoDuration::minutes(30);
        bridge.save(&store, &market, saved_at).unwrap();
        assert!(dir.path().join("flowData.json").exists());
        assert!(dir.path().join("marketState.json").exists());

        let restored = bridge.restore(saved_at + ChronoDuration::minutes(5));
        assert_eq!(restored.series.unwrap(), store.to_samples());
        assert_eq!(restored.market.unwrap(), market);
    }

    #[test]
    fn test_round_trip_preserves_arbitrary_floats() {
        use rand::{rngs::StdRng, Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let mut store = SeriesStore::new(RetentionPolicy::MaxSamples(20_000));
        for i in 0..20_000 {
            store
                .append(SamplePoint::new(
                    t0() + ChronoDuration::seconds(i),
                    rng.random_range(-50_000_000.0..50_000_000.0) / 1e6,
                    rng.random_range(-50_000_000.0..50_000_000.0) / 1e6,
                    rng.random_range(500.0..700.0),
                ))
                .unwrap();
        }

        let mut bridge = PersistenceBridge::new(MemoryStorage::default());
        bridge.save(&store, &MarketState::default(), t0()).unwrap();
        let restored = bridge.restore(t0()).series.unwrap();

        let expected = store.to_samples();
        assert_eq!(restored.len(), expected.len());
        for (index, (actual, want)) in restored.iter().zip(&expected).enumerate() {
            assert_eq!(actual.call_flow.to_bits(), want.call_flow.to_bits(), "call_flow at {index}");
            assert_eq!(actual.put_flow.to_bits(), want.put_flow.to_bits(), "put_flow at {index}");
            assert_eq!(actual.price.to_bits(), want.price.to_bits(), "price at {index}");
        }
    }

    #[test]
    fn test_stale_series_discarded() {
        let mut bridge = PersistenceBridge::new(MemoryStorage::default());
        let store = filled_store();
        bridge.save(&store, &MarketState::default(), t0()).unwrap();

        let restored = bridge.restore(t0() + ChronoDuration::hours(7));
        assert!(restored.series.is_none());
        assert!(bridge.storage().get(FLOW_DATA_KEY).unwrap().is_none());

        // Market context survives longer than the series
        assert!(restored.market.is_some());
    }

    #[test]
    fn test_corrupt_entry_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path());
        storage.set(FLOW_DATA_KEY, "{\"timestamps\": [").unwrap();

        let mut bridge = PersistenceBridge::new(storage);
        let restored = bridge.restore(t0());
        assert_eq!(restored, Restored::default());
        assert!(!dir.path().join("flowData.json").exists());
    }

    #[test]
    fn test_unequal_lengths_removed() {
        let mut storage = MemoryStorage::default();
        let raw = serde_json::json!({
            "timestamps": [t0(), t0() + ChronoDuration::minutes(1)],
            "call_flow": [1.0, 2.0],
            "put_flow": [1.0],
            "price": [600.0, 600.1],
            "last_update": t0(),
        });
        storage.set(FLOW_DATA_KEY, &raw.to_string()).unwrap();

        let mut bridge = PersistenceBridge::new(storage);
        assert!(bridge.restore(t0()).series.is_none());
        assert!(bridge.storage().get(FLOW_DATA_KEY).unwrap().is_none());
    }

    #[test]
    fn test_absent_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut bridge = PersistenceBridge::new(FileStorage::new(dir.path().join("missing")));
        assert_eq!(bridge.restore(t0()), Restored::default());
    }
}
