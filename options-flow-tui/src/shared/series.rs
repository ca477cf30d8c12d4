//! Rolling flow series.
//!
//! Four parallel deques (time, call flow, put flow, price) that always share one length,
//! ordered by timestamp and bounded by a [`RetentionPolicy`].

use crate::shared::error::DashboardError;
use crate::shared::types::SamplePoint;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;

/// Most points handed to the renderer regardless of how much history is retained
pub const MAX_RENDER_POINTS: usize = 14_400;

/// How much history the store keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep at most this many samples, evicting the oldest
    MaxSamples(usize),
    /// Keep samples no older than this wall-clock window
    Window(ChronoDuration),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Window(ChronoDuration::hours(4))
    }
}

#[derive(Debug, Clone)]
pub struct SeriesStore {
    policy: RetentionPolicy,
    timestamps: VecDeque<DateTime<Utc>>,
    call_flow: VecDeque<f64>,
    put_flow: VecDeque<f64>,
    price: VecDeque<f64>,
}

impl Default for SeriesStore {
    fn default() -> Self {
        Self::new(RetentionPolicy::default())
    }
}

impl SeriesStore {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            timestamps: VecDeque::new(),
            call_flow: VecDeque::new(),
            put_flow: VecDeque::new(),
            price: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Append one sample to all four sequences, then apply retention.
    ///
    /// A sample older than the latest one is rejected and nothing is pushed.
    pub fn append(&mut self, sample: SamplePoint) -> Result<usize, DashboardError> {
        if let Some(&latest) = self.timestamps.back() {
            if sample.timestamp < latest {
                return Err(DashboardError::OutOfOrder {
                    latest,
                    incoming: sample.timestamp,
                });
            }
        }

        self.push_unchecked(sample);
        Ok(self.apply_retention(sample.timestamp))
    }

    /// Replace the whole series with `samples` (sorted by time first), then apply retention
    /// relative to `now`.
    pub fn replace_all(&mut self, mut samples: Vec<SamplePoint>, now: DateTime<Utc>) -> usize {
        samples.sort_by_key(|s| s.timestamp);
        self.clear();
        for sample in samples {
            self.push_unchecked(sample);
        }
        self.apply_retention(now)
    }

    pub fn clear(&mut self) {
        self.timestamps.clear();
        self.call_flow.clear();
        self.put_flow.clear();
        self.price.clear();
    }

    fn push_unchecked(&mut self, sample: SamplePoint) {
        self.timestamps.push_back(sample.timestamp);
        self.call_flow.push_back(sample.call_flow);
        self.put_flow.push_back(sample.put_flow);
        self.price.push_back(sample.price);
    }

    /// Evict from the front according to the policy. Returns the number of samples evicted.
    ///
    /// The window policy binary-searches the sorted timestamps for the cutoff and drains the
    /// prefix in one batch. The most recent sample is always kept.
    pub fn apply_retention(&mut self, now: DateTime<Utc>) -> usize {
        let evict = match self.policy {
            RetentionPolicy::MaxSamples(cap) => self.len().saturating_sub(cap),
            RetentionPolicy::Window(window) => {
                if self.is_empty() {
                    return 0;
                }
                let cutoff = now - window;
                let first_kept = self.timestamps.partition_point(|t| *t < cutoff);
                first_kept.min(self.len() - 1)
            }
        };

        if evict > 0 {
            self.timestamps.drain(..evict);
            self.call_flow.drain(..evict);
            self.put_flow.drain(..evict);
            self.price.drain(..evict);
        }

        evict
    }

    /// Drop every sample at or after `cutoff`. Returns the number removed.
    pub fn truncate_from(&mut self, cutoff: DateTime<Utc>) -> usize {
        let keep = self.timestamps.partition_point(|t| *t < cutoff);
        let removed = self.len() - keep;
        self.timestamps.truncate(keep);
        self.call_flow.truncate(keep);
        self.put_flow.truncate(keep);
        self.price.truncate(keep);
        removed
    }

    pub fn get(&self, index: usize) -> Option<SamplePoint> {
        Some(SamplePoint {
            timestamp: *self.timestamps.get(index)?,
            call_flow: *self.call_flow.get(index)?,
            put_flow: *self.put_flow.get(index)?,
            price: *self.price.get(index)?,
        })
    }

    pub fn latest(&self) -> Option<SamplePoint> {
        self.len().checked_sub(1).and_then(|i| self.get(i))
    }

    pub fn first(&self) -> Option<SamplePoint> {
        self.get(0)
    }

    /// The most recent `min(max_points, len)` samples, in order
    pub fn window_slice(&self, max_points: usize) -> SeriesWindow<'_> {
        let start = self.len().saturating_sub(max_points);
        SeriesWindow { store: self, start }
    }

    pub fn iter(&self) -> impl Iterator<Item = SamplePoint> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Owned copy of every retained sample
    pub fn to_samples(&self) -> Vec<SamplePoint> {
        self.iter().collect()
    }

    pub fn timestamps(&self) -> &VecDeque<DateTime<Utc>> {
        &self.timestamps
    }

    pub fn call_flow(&self) -> &VecDeque<f64> {
        &self.call_flow
    }

    pub fn put_flow(&self) -> &VecDeque<f64> {
        &self.put_flow
    }

    pub fn prices(&self) -> &VecDeque<f64> {
        &self.price
    }

    /// Check the parallel-sequence and ordering invariants
    pub fn is_consistent(&self) -> bool {
        let n = self.timestamps.len();
        n == self.call_flow.len()
            && n == self.put_flow.len()
            && n == self.price.len()
            && self
                .timestamps
                .iter()
                .zip(self.timestamps.iter().skip(1))
                .all(|(a, b)| a <= b)
    }
}

/// Borrowed view over the tail of a [`SeriesStore`]
#[derive(Debug, Clone, Copy)]
pub struct SeriesWindow<'a> {
    store: &'a SeriesStore,
    start: usize,
}

impl<'a> SeriesWindow<'a> {
    pub fn len(&self) -> usize {
        self.store.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the first windowed sample within the store
    pub fn start(&self) -> usize {
        self.start
    }

    /// Sample at `index` relative to the window
    pub fn get(&self, index: usize) -> Option<SamplePoint> {
        if index >= self.len() {
            return None;
        }
        self.store.get(self.start + index)
    }

    pub fn timestamps(&self) -> impl Iterator<Item = DateTime<Utc>> + 'a {
        let store: &'a SeriesStore = self.store;
        store.timestamps.range(self.start..).copied()
    }

    pub fn call_flow(&self) -> impl Iterator<Item = f64> + 'a {
        let store: &'a SeriesStore = self.store;
        store.call_flow.range(self.start..).copied()
    }

    pub fn put_flow(&self) -> impl Iterator<Item = f64> + 'a {
        let store: &'a SeriesStore = self.store;
        store.put_flow.range(self.start..).copied()
    }

    pub fn prices(&self) -> impl Iterator<Item = f64> + 'a {
        let store: &'a SeriesStore = self.store;
        store.price.range(self.start..).copied()
    }
}

/// Minimum of a series, `None` for empty input
pub fn series_min(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    values.into_iter().fold(None, |acc, v| match acc {
        Some(m) if m <= v => Some(m),
        _ => Some(v),
    })
}

/// Maximum of a series, `None` for empty input
pub fn series_max(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    values.into_iter().fold(None, |acc, v| match acc {
        Some(m) if m >= v => Some(m),
        _ => Some(v),
    })
}
