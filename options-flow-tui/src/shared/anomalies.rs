//! Classified anomaly buffers with a debounced view rebuild.

use crate::shared::schedule::Debouncer;
use crate::shared::types::{AnomalyRecord, OptionType};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-bucket retention cap
pub const ANOMALY_CAP: usize = 100;
/// Rows shown per bucket
pub const ANOMALY_VIEW_ROWS: usize = 10;
/// Quiet period before a burst of alerts is rendered
pub const ANOMALY_DEBOUNCE: Duration = Duration::from_millis(50);

/// Rendered rows for both panels. Rebuilt in full on every flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnomalyView {
    pub calls: Vec<AnomalyRecord>,
    pub puts: Vec<AnomalyRecord>,
}

#[derive(Debug, Clone)]
pub struct AnomalyBuffer {
    calls: VecDeque<AnomalyRecord>,
    puts: VecDeque<AnomalyRecord>,
    cap: usize,
    debounce: Debouncer,
    view: AnomalyView,
}

impl Default for AnomalyBuffer {
    fn default() -> Self {
        Self::new(ANOMALY_CAP, ANOMALY_DEBOUNCE)
    }
}

impl AnomalyBuffer {
    pub fn new(cap: usize, debounce: Duration) -> Self {
        Self {
            calls: VecDeque::with_capacity(cap),
            puts: VecDeque::with_capacity(cap),
            cap,
            debounce: Debouncer::new(debounce),
            view: AnomalyView::default(),
        }
    }

    /// Append to the bucket matching the option side, evicting the oldest entry past the cap,
    /// and schedule a render.
    pub fn record(&mut self, anomaly: AnomalyRecord, now: Instant) {
        let cap = self.cap;
        let bucket = self.bucket_mut(anomaly.option_type);
        bucket.push_back(anomaly);
        while bucket.len() > cap {
            bucket.pop_front();
        }
        self.debounce.trigger(now);
    }

    /// Seed both buckets from a snapshot, replacing whatever was there.
    pub fn replace_all(&mut self, anomalies: Vec<AnomalyRecord>, now: Instant) {
        self.calls.clear();
        self.puts.clear();
        for anomaly in anomalies {
            self.record(anomaly, now);
        }
        self.debounce.trigger(now);
    }

    fn bucket_mut(&mut self, side: OptionType) -> &mut VecDeque<AnomalyRecord> {
        match side {
            OptionType::Call => &mut self.calls,
            OptionType::Put => &mut self.puts,
        }
    }

    pub fn bucket(&self, side: OptionType) -> &VecDeque<AnomalyRecord> {
        match side {
            OptionType::Call => &self.calls,
            OptionType::Put => &self.puts,
        }
    }

    /// The `n` most recent entries of a bucket, newest first. Sorts a copy.
    pub fn top_n(&self, side: OptionType, n: usize) -> Vec<AnomalyRecord> {
        let mut rows: Vec<AnomalyRecord> = self.bucket(side).iter().cloned().collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        rows.truncate(n);
        rows
    }

    /// Rebuild the view from the buckets
    pub fn render(&mut self) {
        self.view = AnomalyView {
            calls: self.top_n(OptionType::Call, ANOMALY_VIEW_ROWS),
            puts: self.top_n(OptionType::Put, ANOMALY_VIEW_ROWS),
        };
        debug!(
            calls = self.calls.len(),
            puts = self.puts.len(),
            "anomaly view rebuilt"
        );
    }

    /// Render if the debounce deadline has passed. Returns true when a render happened.
    pub fn flush(&mut self, now: Instant) -> bool {
        if self.debounce.poll(now) {
            self.render();
            true
        } else {
            false
        }
    }

    pub fn view(&self) -> &AnomalyView {
        &self.view
    }

    pub fn len(&self) -> usize {
        self.calls.len() + self.puts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
