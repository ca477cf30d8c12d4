//! Everything the dashboard knows, owned by the UI loop task.
//!
//! Snapshot results, push events, status changes and timer ticks are all funnelled through
//! [`SessionState`] so no two handlers ever touch the series at the same time.

use crate::shared::anomalies::AnomalyBuffer;
use crate::shared::config::DashboardConfig;
use crate::shared::error::DashboardError;
use crate::shared::fallback::SimulatedFeed;
use crate::shared::market::MarketState;
use crate::shared::persist::{LocalStorage, PersistenceBridge};
use crate::shared::realtime::ConnectionStatus;
use crate::shared::schedule::{RedrawReason, RedrawScheduler, Throttle};
use crate::shared::series::{RetentionPolicy, SeriesStore};
use crate::shared::snapshot::BootstrapData;
use crate::shared::types::{AnomalyRecord, MarketStateResponse, PushEvent, SamplePoint};
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How often window retention is re-applied against the wall clock
const RETENTION_SWEEP: Duration = Duration::from_secs(60);

/// What the loop should do after a tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickActions {
    pub redraw: bool,
    pub anomalies_rendered: bool,
}

pub struct SessionState {
    pub series: SeriesStore,
    pub anomalies: AnomalyBuffer,
    pub market: MarketState,
    status: ConnectionStatus,
    /// Flow pushes folded in since startup
    live_samples: usize,
    bootstrap_complete: bool,
    redraw: RedrawScheduler,
    persist: Throttle,
    retention_sweep: Throttle,
    /// Series changed since the last save
    dirty: bool,
    simulator: Option<SimulatedFeed>,
    /// Timestamp of the first synthetic sample still in the series
    simulated_from: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new(
        retention: RetentionPolicy,
        redraw_interval: Duration,
        persist_interval: Duration,
        simulate: bool,
    ) -> Self {
        Self {
            series: SeriesStore::new(retention),
            anomalies: AnomalyBuffer::default(),
            market: MarketState::default(),
            status: ConnectionStatus::Reconnecting,
            live_samples: 0,
            bootstrap_complete: false,
            redraw: RedrawScheduler::new(redraw_interval),
            persist: Throttle::new(persist_interval),
            retention_sweep: Throttle::new(RETENTION_SWEEP),
            dirty: false,
            simulator: simulate.then(|| SimulatedFeed::new(rand::random())),
            simulated_from: None,
        }
    }

    pub fn from_config(config: &DashboardConfig) -> Self {
        Self::new(
            config.retention,
            config.redraw_interval,
            config.persist_interval,
            config.simulate,
        )
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn live_samples(&self) -> usize {
        self.live_samples
    }

    pub fn bootstrap_complete(&self) -> bool {
        self.bootstrap_complete
    }

    /// Synthetic samples are being generated right now
    pub fn is_simulating(&self) -> bool {
        self.simulator.is_some() && self.status == ConnectionStatus::Disconnected
    }

    pub fn request_redraw(&mut self, reason: RedrawReason) {
        self.redraw.request(reason);
    }

    /// Seed the session from local storage. Returns true if a series was restored.
    pub fn restore_from<S: LocalStorage>(
        &mut self,
        bridge: &mut PersistenceBridge<S>,
        now: DateTime<Utc>,
    ) -> bool {
        let restored = bridge.restore(now);

        if let Some(market) = restored.market {
            self.market = market;
        }

        let Some(samples) = restored.series else {
            return false;
        };
        let evicted = self.series.replace_all(samples, now);
        if evicted > 0 {
            debug!(evicted, "trimmed restored series to retention");
        }
        self.redraw.request(RedrawReason::Reload);
        !self.series.is_empty()
    }

    /// Fold in the startup flow history.
    ///
    /// Dropped if live pushes already arrived. An empty history keeps whatever was restored;
    /// a non-empty one replaces it. Returns true if the series was replaced.
    pub fn apply_flow_history(&mut self, samples: Vec<SamplePoint>, now: DateTime<Utc>) -> bool {
        if self.live_samples > 0 {
            info!(
                live = self.live_samples,
                "discarding late flow snapshot, live data already present"
            );
            return false;
        }
        if samples.is_empty() {
            debug!("empty flow snapshot, keeping existing series");
            return false;
        }

        self.series.replace_all(samples, now);
        self.simulated_from = None;
        if let Some(latest) = self.series.latest() {
            self.market.update_price(latest.price);
        }
        self.dirty = true;
        self.redraw.request(RedrawReason::Reload);
        true
    }

    pub fn apply_anomaly_snapshot(&mut self, anomalies: Vec<AnomalyRecord>, tick: Instant) {
        if anomalies.is_empty() {
            return;
        }
        self.anomalies.replace_all(anomalies, tick);
    }

    pub fn apply_market_snapshot(&mut self, snapshot: &MarketStateResponse) {
        self.market.apply_snapshot(snapshot);
        self.redraw.request(RedrawReason::Data);
    }

    /// Apply all three startup results, logging the ones that failed
    pub fn apply_bootstrap(&mut self, data: BootstrapData, now: DateTime<Utc>, tick: Instant) {
        match data.market {
            Ok(market) => self.apply_market_snapshot(&market),
            Err(err) => log_fetch_error("market state", &err),
        }
        match data.flow {
            Ok(samples) => {
                self.apply_flow_history(samples, now);
            }
            Err(err) => log_fetch_error("flow", &err),
        }
        match data.anomalies {
            Ok(anomalies) => self.apply_anomaly_snapshot(anomalies, tick),
            Err(err) => log_fetch_error("anomaly", &err),
        }
        self.bootstrap_complete = true;
    }

    /// Mark bootstrap finished without results (e.g. the loader task died)
    pub fn bootstrap_failed(&mut self, err: &DashboardError) {
        log_fetch_error("startup", err);
        self.bootstrap_complete = true;
    }

    /// Fold in a history reload requested while live data may already be flowing.
    ///
    /// The reloaded rows become the base of the series and live samples newer than the
    /// last reloaded row stay on top. Synthetic samples are dropped. An empty reload keeps
    /// the current series. Returns true if the series was replaced.
    pub fn apply_flow_reload(
        &mut self,
        result: Result<Vec<SamplePoint>, DashboardError>,
        now: DateTime<Utc>,
    ) -> bool {
        let samples = match result {
            Ok(samples) => samples,
            Err(err) => {
                log_fetch_error("flow reload", &err);
                return false;
            }
        };
        let Some(reloaded_until) = samples.iter().map(|s| s.timestamp).max() else {
            debug!("empty flow reload, keeping existing series");
            return false;
        };

        self.drop_simulated();
        let mut merged = samples;
        merged.extend(self.series.iter().filter(|s| s.timestamp > reloaded_until));
        let evicted = self.series.replace_all(merged, now);
        info!(samples = self.series.len(), evicted, "reloaded flow history");

        if let Some(latest) = self.series.latest() {
            self.market.update_price(latest.price);
        }
        self.dirty = true;
        self.redraw.request(RedrawReason::Reload);
        true
    }

    pub fn handle_push(&mut self, event: PushEvent, now: DateTime<Utc>, tick: Instant) {
        match event {
            PushEvent::Flow(flow) => {
                debug!(
                    lag_ms = (now - flow.timestamp).num_milliseconds(),
                    "flow pushed"
                );
                self.drop_simulated();
                match self.series.append(flow.to_sample()) {
                    Ok(_) => {
                        self.live_samples += 1;
                        self.dirty = true;
                    }
                    Err(err) => {
                        warn!(%err, "dropping flow push");
                        return;
                    }
                }
                self.market.apply_flow_event(&flow);
                self.redraw.request(RedrawReason::Data);
            }
            PushEvent::Price(price) => {
                self.market.update_price(price.price);
                self.redraw.request(RedrawReason::Data);
            }
            PushEvent::Anomaly(anomaly) => {
                debug!(
                    side = %anomaly.option_type,
                    strike = anomaly.strike,
                    "anomaly pushed"
                );
                self.anomalies.record(anomaly, tick);
            }
        }
    }

    pub fn handle_status(&mut self, status: ConnectionStatus) {
        if status != self.status {
            info!(?status, "connection status changed");
        }
        self.status = status;
        self.redraw.request(RedrawReason::Data);
    }

    fn drop_simulated(&mut self) {
        if let Some(from) = self.simulated_from.take() {
            let removed = self.series.truncate_from(from);
            debug!(removed, "removed simulated samples");
        }
    }

    /// Run timers: retention sweep, simulated feed, anomaly debounce, redraw throttle
    pub fn tick(&mut self, now: DateTime<Utc>, tick: Instant) -> TickActions {
        // Appends only trim against their own timestamp, a stalled feed needs the clock
        if self.retention_sweep.try_fire(tick) {
            let evicted = self.series.apply_retention(now);
            if evicted > 0 {
                debug!(evicted, "retention sweep");
                self.dirty = true;
                self.redraw.request(RedrawReason::Data);
            }
        }

        if self.is_simulating() {
            let previous = self.series.latest();
            let sample = self
                .simulator
                .as_mut()
                .and_then(|feed| feed.poll(tick, now, previous));
            if let Some(sample) = sample {
                if self.series.append(sample).is_ok() {
                    self.simulated_from.get_or_insert(sample.timestamp);
                    self.market.update_price(sample.price);
                    self.redraw.request(RedrawReason::Data);
                }
            }
        }

        let anomalies_rendered = self.anomalies.flush(tick);
        if anomalies_rendered {
            self.redraw.request(RedrawReason::Data);
        }

        TickActions {
            redraw: self.redraw.poll(tick),
            anomalies_rendered,
        }
    }

    /// Save if something changed and the persist interval has passed
    pub fn maybe_persist<S: LocalStorage>(
        &mut self,
        bridge: &mut PersistenceBridge<S>,
        now: DateTime<Utc>,
        tick: Instant,
    ) -> bool {
        if !self.dirty || !self.persist.ready(tick) {
            return false;
        }
        self.persist.mark(tick);
        self.persist_now(bridge, now)
    }

    /// Save immediately, leaving synthetic samples out
    pub fn persist_now<S: LocalStorage>(
        &mut self,
        bridge: &mut PersistenceBridge<S>,
        now: DateTime<Utc>,
    ) -> bool {
        let result = match self.simulated_from {
            Some(from) => {
                let mut real = self.series.clone();
                real.truncate_from(from);
                bridge.save(&real, &self.market, now)
            }
            None => bridge.save(&self.series, &self.market, now),
        };

        match result {
            Ok(()) => {
                self.dirty = false;
                true
            }
            Err(err) => {
                warn!(%err, "failed to persist flow data");
                false
            }
        }
    }
}

/// Network failures leave the session on its current data; anything else means the
/// backend answered with something unusable.
fn log_fetch_error(what: &str, err: &DashboardError) {
    if err.is_transport() {
        warn!(%err, "{} snapshot unavailable, keeping current data", what);
    } else {
        error!(%err, "{} snapshot rejected", what);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::persist::MemoryStorage;
    use crate::shared::types::{FlowEvent, OptionType, PriceEvent, Severity};
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap()
    }

    fn session() -> SessionState {
        SessionState::new(
            RetentionPolicy::Window(ChronoDuration::hours(4)),
            Duration::from_secs(2),
            Duration::from_secs(10),
            false,
        )
    }

    fn flow(minute: i64, call: f64) -> PushEvent {
        PushEvent::Flow(FlowEvent {
            timestamp: t0() + ChronoDuration::minutes(minute),
            cum_call_flow: call * 1_000_000.0,
            cum_put_flow: 500_000.0,
            spy_price: 600.0 + minute as f64 * 0.1,
            previous_close: None,
            spy_change_pct: None,
            atm_range: None,
        })
    }

    fn history(n: i64) -> Vec<SamplePoint> {
        (0..n)
            .map(|i| SamplePoint::new(t0() + ChronoDuration::minutes(i), i as f64, 0.5, 600.0))
            .collect()
    }

    #[test]
    fn test_snapshot_discarded_after_live_data() {
        let mut state = session();
        let tick = Instant::now();
        state.handle_push(flow(30, 2.0), t0(), tick);
        assert_eq!(state.live_samples(), 1);

        assert!(!state.apply_flow_history(history(20), t0()));
        assert_eq!(state.series.len(), 1);
    }

    #[test]
    fn test_snapshot_supersedes_restored() {
        let mut bridge = PersistenceBridge::new(MemoryStorage::default());
        let mut first = session();
        first.apply_flow_history(history(5), t0());
        assert!(first.persist_now(&mut bridge, t0()));

        let mut state = session();
        assert!(state.restore_from(&mut bridge, t0() + ChronoDuration::minutes(10)));
        assert_eq!(state.series.len(), 5);

        // Empty snapshot keeps the restored series
        assert!(!state.apply_flow_history(Vec::new(), t0()));
        assert_eq!(state.series.len(), 5);

        assert!(state.apply_flow_history(history(12), t0()));
        assert_eq!(state.series.len(), 12);
    }

    #[test]
    fn test_out_of_order_push_dropped() {
        let mut state = session();
        let tick = Instant::now();
        state.handle_push(flow(10, 1.0), t0(), tick);
        state.handle_push(flow(5, 9.0), t0(), tick);
        assert_eq!(state.series.len(), 1);
        assert_eq!(state.live_samples(), 1);
        assert!(state.series.is_consistent());
    }

    #[test]
    fn test_price_push_updates_market() {
        let mut state = session();
        state.market.previous_close = Some(600.0);
        state.handle_push(PushEvent::Price(PriceEvent { price: 606.0 }), t0(), Instant::now());
        assert!((state.market.change_percent.unwrap() - 1.0).abs() < 1e-9);
        assert!(state.series.is_empty());
    }

    #[test]
    fn test_anomaly_push_debounced_through_tick() {
        let mut state = session();
        let tick = Instant::now();
        state.handle_push(
            PushEvent::Anomaly(AnomalyRecord {
                timestamp: t0(),
                option_type: OptionType::Call,
                strike: 690.0,
                mid_price: 1.1,
                deviation_percent: 80.0,
                severity: Severity::High,
            }),
            t0(),
            tick,
        );

        assert!(!state.tick(t0(), tick).anomalies_rendered);
        let actions = state.tick(t0(), tick + Duration::from_millis(60));
        assert!(actions.anomalies_rendered);
        assert_eq!(state.anomalies.view().calls.len(), 1);
    }

    #[test]
    fn test_persist_throttled_and_only_when_dirty() {
        let mut bridge = PersistenceBridge::new(MemoryStorage::default());
        let mut state = session();
        let tick = Instant::now();

        assert!(!state.maybe_persist(&mut bridge, t0(), tick));

        state.handle_push(flow(1, 1.0), t0(), tick);
        assert!(state.maybe_persist(&mut bridge, t0(), tick));

        state.handle_push(flow(2, 1.1), t0(), tick);
        assert!(!state.maybe_persist(&mut bridge, t0(), tick + Duration::from_secs(3)));
        assert!(state.maybe_persist(&mut bridge, t0(), tick + Duration::from_secs(10)));
    }

    #[test]
    fn test_simulated_samples_not_persisted() {
        let mut bridge = PersistenceBridge::new(MemoryStorage::default());
        let mut state = SessionState::new(
            RetentionPolicy::MaxSamples(480),
            Duration::from_secs(2),
            Duration::from_secs(10),
            true,
        );
        let tick = Instant::now();

        state.handle_push(flow(0, 1.0), t0(), tick);
        state.handle_status(ConnectionStatus::Disconnected);
        assert!(state.is_simulating());

        state.tick(t0() + ChronoDuration::minutes(1), tick);
        state.tick(t0() + ChronoDuration::minutes(2), tick + Duration::from_secs(2));
        assert_eq!(state.series.len(), 3);

        assert!(state.persist_now(&mut bridge, t0() + ChronoDuration::minutes(2)));
        let restored = bridge.restore(t0() + ChronoDuration::minutes(3));
        assert_eq!(restored.series.unwrap().len(), 1);

        // Real data returns and replaces the synthetic tail
        state.handle_status(ConnectionStatus::Connected);
        state.handle_push(flow(1, 1.2), t0(), tick);
        assert_eq!(state.series.len(), 2);
        assert!(!state.is_simulating());
    }

    #[test]
    fn test_retention_sweep_trims_stalled_feed() {
        let mut bridge = PersistenceBridge::new(MemoryStorage::default());
        let mut state = session();
        let tick = Instant::now();
        state.apply_flow_history(history(10), t0() + ChronoDuration::minutes(10));
        assert!(state.persist_now(&mut bridge, t0() + ChronoDuration::minutes(10)));
        assert_eq!(state.series.len(), 10);

        // No pushes for five hours: only the latest sample stays
        state.tick(t0() + ChronoDuration::hours(5), tick);
        assert_eq!(state.series.len(), 1);
        assert_eq!(state.series.latest().unwrap().call_flow, 9.0);
        assert!(state.maybe_persist(&mut bridge, t0() + ChronoDuration::hours(5), tick));
        let saved = bridge.restore(t0() + ChronoDuration::hours(5)).series.unwrap();
        assert_eq!(saved.len(), 1);
    }

    #[test]
    fn test_retention_sweep_runs_on_slow_cadence() {
        let mut state = session();
        let tick = Instant::now();
        state.tick(t0(), tick);

        state.apply_flow_history(history(10), t0() + ChronoDuration::minutes(10));
        state.tick(t0() + ChronoDuration::hours(5), tick + Duration::from_secs(1));
        assert_eq!(state.series.len(), 10);

        state.tick(t0() + ChronoDuration::hours(5), tick + RETENTION_SWEEP);
        assert_eq!(state.series.len(), 1);
    }

    #[test]
    fn test_flow_reload_keeps_newer_live_samples() {
        let mut state = session();
        let tick = Instant::now();
        state.apply_flow_history(history(5), t0());
        state.handle_push(flow(10, 7.0), t0(), tick);
        state.handle_push(flow(11, 7.5), t0(), tick);

        // Backend history reaches minute 10 with a revised value
        let mut reloaded = history(10);
        reloaded.push(SamplePoint::new(t0() + ChronoDuration::minutes(10), 6.5, 0.5, 601.0));
        assert!(state.apply_flow_reload(Ok(reloaded), t0() + ChronoDuration::minutes(11)));

        let samples = state.series.to_samples();
        assert_eq!(samples.len(), 12);
        assert_eq!(samples[10].call_flow, 6.5);
        assert_eq!(samples[11].call_flow, 7.5);
        assert!(state.series.is_consistent());
        assert_eq!(state.live_samples(), 2);
    }

    #[test]
    fn test_flow_reload_failure_keeps_series() {
        let mut state = session();
        state.apply_flow_history(history(5), t0());

        assert!(!state.apply_flow_reload(Err(DashboardError::Status(503)), t0()));
        assert!(!state.apply_flow_reload(
            Err(DashboardError::Decode("expected `,`".to_string())),
            t0()
        ));
        assert!(!state.apply_flow_reload(Ok(Vec::new()), t0()));
        assert_eq!(state.series.len(), 5);
    }

    #[test]
    fn test_failed_bootstrap_keeps_restored_data() {
        let mut bridge = PersistenceBridge::new(MemoryStorage::default());
        let mut first = session();
        first.apply_flow_history(history(4), t0());
        first.persist_now(&mut bridge, t0());

        let mut state = session();
        state.restore_from(&mut bridge, t0());
        state.apply_bootstrap(
            BootstrapData {
                flow: Err(DashboardError::Http("connection refused".to_string())),
                anomalies: Err(DashboardError::Decode("missing field `anomalies`".to_string())),
                market: Err(DashboardError::Status(502)),
            },
            t0(),
            Instant::now(),
        );

        assert!(state.bootstrap_complete());
        assert_eq!(state.series.len(), 4);
        assert!(state.anomalies.is_empty());
    }

    #[test]
    fn test_forced_redraw_on_restore() {
        let mut bridge = PersistenceBridge::new(MemoryStorage::default());
        let mut first = session();
        first.apply_flow_history(history(3), t0());
        first.persist_now(&mut bridge, t0());

        let mut state = session();
        let tick = Instant::now();
        state.request_redraw(RedrawReason::Data);
        assert!(state.tick(t0(), tick).redraw);

        state.restore_from(&mut bridge, t0());
        assert!(state.tick(t0(), tick + Duration::from_millis(10)).redraw);
    }
}
