/// Core data types for flow samples, anomaly alerts and push events
///
/// The wire types match the JSON served by the flow backend (`/flow/snapshot`,
/// `/api/dashboard/snapshot`, `/api/market/state`) and the hub invocations
/// pushed over the realtime channel.

use crate::shared::error::DashboardError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Cumulative flows arrive in raw premium dollars; the series and chart work in millions.
pub const FLOW_SCALE: f64 = 1_000_000.0;

/// One time-indexed observation of the rolling series
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct SamplePoint {
    pub timestamp: DateTime<Utc>,
    /// Cumulative call premium flow (millions)
    pub call_flow: f64,
    /// Cumulative put premium flow (millions)
    pub put_flow: f64,
    /// Underlying price
    pub price: f64,
}

impl SamplePoint {
    pub fn new(timestamp: DateTime<Utc>, call_flow: f64, put_flow: f64, price: f64) -> Self {
        Self {
            timestamp,
            call_flow,
            put_flow,
            price,
        }
    }

    /// Net premium flow (calls minus puts), in millions
    pub fn net_flow(&self) -> f64 {
        self.call_flow - self.put_flow
    }
}

/// Option side of an anomaly
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Parse the codes used across the backend ("CALL", "C", "PUT", "P")
    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "CALL" | "C" => Some(OptionType::Call),
            "PUT" | "P" => Some(OptionType::Put),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "CALL",
            OptionType::Put => "PUT",
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl<'de> Deserialize<'de> for OptionType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        OptionType::from_code(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown option type: {raw}")))
    }
}

/// Anomaly severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    #[default]
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MED",
            Severity::High => "HIGH",
        }
    }
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" | "MED" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            _ => Err(serde::de::Error::custom(format!("unknown severity: {raw}"))),
        }
    }
}

/// Anomaly alert produced by the detector
///
/// Push payloads use the detector field names; the dashboard snapshot uses the short
/// public names (`type`, `price`, `deviation`) and carries no severity.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AnomalyRecord {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(alias = "type")]
    pub option_type: OptionType,
    pub strike: f64,
    #[serde(alias = "price")]
    pub mid_price: f64,
    #[serde(alias = "deviation")]
    pub deviation_percent: f64,
    #[serde(default)]
    pub severity: Severity,
}

/// Row of `GET /flow/snapshot`
#[derive(Debug, Clone, Deserialize)]
pub struct FlowRow {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub cum_call_flow: f64,
    pub cum_put_flow: f64,
    pub spy_price: f64,
}

impl FlowRow {
    pub fn to_sample(&self) -> SamplePoint {
        SamplePoint::new(
            self.timestamp,
            self.cum_call_flow / FLOW_SCALE,
            self.cum_put_flow / FLOW_SCALE,
            self.spy_price,
        )
    }
}

/// Response of `GET /flow/snapshot?hours=N`
#[derive(Debug, Clone, Deserialize)]
pub struct FlowHistoryResponse {
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub history: Vec<FlowRow>,
}

/// Response of `GET /api/dashboard/snapshot`
///
/// Anomalies stay raw so a single malformed entry does not drop the whole snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct DashboardSnapshotResponse {
    #[serde(default)]
    pub anomalies: Vec<serde_json::Value>,
}

/// Session status reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarketStatus {
    Open,
    Closed,
    Premarket,
    #[serde(other)]
    Unknown,
}

impl MarketStatus {
    pub fn label(&self) -> &'static str {
        match self {
            MarketStatus::Open => "OPEN",
            MarketStatus::Closed => "CLOSED",
            MarketStatus::Premarket => "PRE",
            MarketStatus::Unknown => "?",
        }
    }
}

/// Response of `GET /api/market/state`
#[derive(Debug, Clone, Deserialize)]
pub struct MarketStateResponse {
    pub previous_close: Option<f64>,
    pub atm_min: Option<f64>,
    pub atm_max: Option<f64>,
    pub market_status: Option<MarketStatus>,
}

/// ATM band carried on flow events
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct AtmRangePayload {
    #[serde(alias = "min_strike")]
    pub min: f64,
    #[serde(alias = "max_strike")]
    pub max: f64,
}

/// `flow` hub invocation payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlowEvent {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub cum_call_flow: f64,
    pub cum_put_flow: f64,
    pub spy_price: f64,
    #[serde(default)]
    pub previous_close: Option<f64>,
    #[serde(default)]
    pub spy_change_pct: Option<f64>,
    #[serde(default)]
    pub atm_range: Option<AtmRangePayload>,
}

impl FlowEvent {
    pub fn to_sample(&self) -> SamplePoint {
        SamplePoint::new(
            self.timestamp,
            self.cum_call_flow / FLOW_SCALE,
            self.cum_put_flow / FLOW_SCALE,
            self.spy_price,
        )
    }

    fn validate(&self) -> Result<(), DashboardError> {
        let finite = [self.cum_call_flow, self.cum_put_flow, self.spy_price]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.spy_price <= 0.0 {
            return Err(DashboardError::Decode(format!(
                "flow event out of range: call={} put={} price={}",
                self.cum_call_flow, self.cum_put_flow, self.spy_price
            )));
        }
        Ok(())
    }
}

/// `price` hub invocation payload
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct PriceEvent {
    pub price: f64,
}

/// Hub event names the dashboard subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Flow,
    Price,
    AnomalyDetected,
}

impl EventName {
    pub const ALL: [EventName; 3] = [EventName::Flow, EventName::Price, EventName::AnomalyDetected];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Flow => "flow",
            EventName::Price => "price",
            EventName::AnomalyDetected => "anomalyDetected",
        }
    }

    pub fn from_target(target: &str) -> Option<Self> {
        EventName::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(target))
    }
}

/// Validated push event
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Flow(FlowEvent),
    Price(PriceEvent),
    Anomaly(AnomalyRecord),
}

impl PushEvent {
    /// Decode a hub invocation into a typed event.
    ///
    /// Returns `Ok(None)` for targets the dashboard does not handle.
    pub fn decode(target: &str, payload: serde_json::Value) -> Result<Option<Self>, DashboardError> {
        let Some(name) = EventName::from_target(target) else {
            return Ok(None);
        };

        let event = match name {
            EventName::Flow => {
                let flow: FlowEvent = serde_json::from_value(payload)?;
                flow.validate()?;
                PushEvent::Flow(flow)
            }
            EventName::Price => {
                let price: PriceEvent = serde_json::from_value(payload)?;
                if !price.price.is_finite() || price.price <= 0.0 {
                    return Err(DashboardError::Decode(format!(
                        "price out of range: {}",
                        price.price
                    )));
                }
                PushEvent::Price(price)
            }
            EventName::AnomalyDetected => PushEvent::Anomaly(serde_json::from_value(payload)?),
        };

        Ok(Some(event))
    }

    pub fn name(&self) -> EventName {
        match self {
            PushEvent::Flow(_) => EventName::Flow,
            PushEvent::Price(_) => EventName::Price,
            PushEvent::Anomaly(_) => EventName::AnomalyDetected,
        }
    }
}

/// Parse a backend timestamp.
///
/// Accepts RFC 3339 and naive ISO-8601 strings; naive strings carry no offset and are UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DashboardError> {
    let trimmed = raw.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(&format!("{trimmed}Z")) {
        return Ok(parsed.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| DashboardError::Timestamp(raw.to_string()))
}

/// Convert a unix timestamp in seconds or milliseconds
fn timestamp_from_unix(value: i64) -> Result<DateTime<Utc>, DashboardError> {
    // Anything past year 5138 in seconds is a millisecond timestamp
    let parsed = if value.abs() >= 100_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    };
    parsed.ok_or_else(|| DashboardError::Timestamp(value.to_string()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Text(String),
    Int(i64),
    Float(f64),
}

/// Serde adapter for [`parse_timestamp`] that also accepts unix numbers
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let parsed = match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Text(text) => parse_timestamp(&text),
        RawTimestamp::Int(value) => timestamp_from_unix(value),
        RawTimestamp::Float(value) => timestamp_from_unix(value as i64),
    };
    parsed.map_err(serde::de::Error::custom)
}
