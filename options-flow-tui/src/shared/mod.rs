/// Shared modules for the options flow dashboard
pub mod anomalies;
pub mod chart;
pub mod config;
pub mod error;
pub mod fallback;
pub mod market;
pub mod persist;
pub mod realtime;
pub mod schedule;
pub mod series;
pub mod session;
pub mod snapshot;
pub mod types;
pub mod widgets;
