/// Options Flow TUI - Shared Library
///
/// Core of the `flow-monitor` dashboard:
/// - rolling call/put premium series with retention
/// - anomaly buffers with debounced rendering
/// - local persistence with staleness checks
/// - chart rendering with pointer hover lookup
/// - REST snapshot bootstrap and the realtime push channel
pub mod shared;

// Re-export commonly used types for convenience
pub use shared::types::{
    AnomalyRecord, EventName, FlowEvent, MarketStatus, OptionType, PriceEvent, PushEvent,
    SamplePoint, Severity,
};

pub use shared::error::DashboardError;

pub use shared::realtime::{ConnectionStatus, RealtimeClient, RealtimeConfig};

pub use shared::series::{RetentionPolicy, SeriesStore, SeriesWindow};

pub use shared::anomalies::{AnomalyBuffer, AnomalyView};
pub use shared::chart::{ChartRenderer, DrawOutcome, HoverInfo, LineStrategy};
pub use shared::config::DashboardConfig;
pub use shared::market::MarketState;
pub use shared::persist::{FileStorage, LocalStorage, MemoryStorage, PersistenceBridge, Restored};
pub use shared::schedule::RedrawReason;
pub use shared::session::{SessionState, TickActions};
pub use shared::snapshot::{BootstrapData, SnapshotLoader};
