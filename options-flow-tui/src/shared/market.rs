use crate::shared::types::{FlowEvent, MarketStateResponse, MarketStatus};
use serde::{Deserialize, Serialize};

/// Half-width of the at-the-money strike band
pub const ATM_HALF_WIDTH: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct AtmRange {
    pub min: f64,
    pub max: f64,
}

impl AtmRange {
    pub fn around(center: f64) -> Self {
        Self {
            min: center - ATM_HALF_WIDTH,
            max: center + ATM_HALF_WIDTH,
        }
    }
}

/// Derived price context shown in the header. Every field is unknown until the first
/// snapshot or push supplies it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MarketState {
    pub previous_close: Option<f64>,
    pub atm_center: Option<f64>,
    pub atm_range: Option<AtmRange>,
    pub current_price: Option<f64>,
    pub change_percent: Option<f64>,
    pub market_status: Option<MarketStatus>,
}

impl MarketState {
    /// Fold in a new underlying price.
    ///
    /// Change percent needs a positive previous close. The ATM band only moves when the
    /// rounded price moves.
    pub fn update_price(&mut self, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        self.current_price = Some(price);

        if let Some(prev) = self.previous_close.filter(|p| *p > 0.0) {
            self.change_percent = Some((price - prev) / prev * 100.0);
        }

        let center = price.round();
        if self.atm_center != Some(center) {
            self.atm_center = Some(center);
            self.atm_range = Some(AtmRange::around(center));
        }
    }

    /// Apply a flow push. Backend-supplied previous close, change and ATM band win over the
    /// locally derived values.
    pub fn apply_flow_event(&mut self, event: &FlowEvent) {
        if let Some(prev) = event.previous_close.filter(|p| *p > 0.0) {
            self.previous_close = Some(prev);
        }

        self.update_price(event.spy_price);

        if let Some(pct) = event.spy_change_pct.filter(|p| p.is_finite()) {
            self.change_percent = Some(pct);
        }
        if let Some(range) = event.atm_range {
            self.atm_range = Some(AtmRange {
                min: range.min,
                max: range.max,
            });
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: &MarketStateResponse) {
        if let Some(prev) = snapshot.previous_close.filter(|p| *p > 0.0) {
            self.previous_close = Some(prev);
            if let Some(price) = self.current_price {
                self.change_percent = Some((price - prev) / prev * 100.0);
            }
        }
        if let (Some(min), Some(max)) = (snapshot.atm_min, snapshot.atm_max) {
            self.atm_range = Some(AtmRange { min, max });
            self.atm_center = Some(((min + max) / 2.0).round());
        }
        if snapshot.market_status.is_some() {
            self.market_status = snapshot.market_status;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::types::AtmRangePayload;
    use chrono::Utc;

    #[test]
    fn test_change_percent_requires_previous_close() {
        let mut state = MarketState::default();
        state.update_price(600.0);
        assert_eq!(state.current_price, Some(600.0));
        assert_eq!(state.change_percent, None);

        state.previous_close = Some(500.0);
        state.update_price(510.0);
        assert!((state.change_percent.unwrap() - 2.0).abs() < 1e-9);

        state.previous_close = Some(0.0);
        state.update_price(520.0);
        assert!((state.change_percent.unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_atm_range_recentres_on_rounded_change() {
        struct TestCase {
            price: f64,
            expected: AtmRange,
        }

        let mut state = MarketState::default();
        let tests = vec![
            TestCase {
                // TC0: first price sets the band
                price: 600.2,
                expected: AtmRange { min: 595.0, max: 605.0 },
            },
            TestCase {
                // TC1: same rounded price keeps the band
                price: 600.4,
                expected: AtmRange { min: 595.0, max: 605.0 },
            },
            TestCase {
                // TC2: crossing .5 recentres
                price: 600.6,
                expected: AtmRange { min: 596.0, max: 606.0 },
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            state.update_price(test.price);
            assert_eq!(state.atm_range, Some(test.expected), "TC{} failed", index);
        }
    }

    #[test]
    fn test_flow_event_overrides() {
        let mut state = MarketState::default();
        let event = FlowEvent {
            timestamp: Utc::now(),
            cum_call_flow: 0.0,
            cum_put_flow: 0.0,
            spy_price: 601.0,
            previous_close: Some(600.0),
            spy_change_pct: Some(0.5),
            atm_range: Some(AtmRangePayload { min: 590.0, max: 610.0 }),
        };

        state.apply_flow_event(&event);
        assert_eq!(state.previous_close, Some(600.0));
        assert_eq!(state.change_percent, Some(0.5));
        assert_eq!(state.atm_range, Some(AtmRange { min: 590.0, max: 610.0 }));
    }

    #[test]
    fn test_apply_snapshot() {
        let mut state = MarketState::default();
        state.update_price(606.0);
        state.apply_snapshot(&MarketStateResponse {
            previous_close: Some(600.0),
            atm_min: Some(600.0),
            atm_max: Some(610.0),
            market_status: Some(MarketStatus::Open),
        });

        assert!((state.change_percent.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(state.atm_center, Some(605.0));
        assert_eq!(state.market_status, Some(MarketStatus::Open));
    }
}
