/// Push channel client for the flow hub
///
/// Speaks the SignalR JSON hub protocol over a WebSocket: negotiate for a hub URL and token,
/// connect, handshake, then stream invocations. Reconnects on a fixed delay schedule and
/// keeps retrying after it is exhausted.

use crate::shared::error::DashboardError;
use crate::shared::types::{EventName, PushEvent};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Hub protocol record separator
pub const RECORD_SEPARATOR: char = '\u{1e}';

const HANDSHAKE: &str = "{\"protocol\":\"json\",\"version\":1}\u{1e}";
const PING: &str = "{\"type\":6}\u{1e}";

/// Realtime client configuration
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Endpoint returning the hub URL and access token
    pub negotiate_url: String,
    /// Delay before each reconnect attempt; the last entry repeats once exhausted
    pub reconnect_delays: Vec<Duration>,
    /// Interval between client pings
    pub ping_interval: Duration,
    /// Maximum channel buffer size for events
    pub channel_buffer_size: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            negotiate_url: "http://127.0.0.1:30080/negotiate".to_string(),
            reconnect_delays: vec![
                Duration::ZERO,
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            ping_interval: Duration::from_secs(15),
            channel_buffer_size: 1000,
        }
    }
}

impl RealtimeConfig {
    pub fn new(negotiate_url: impl Into<String>) -> Self {
        Self {
            negotiate_url: negotiate_url.into(),
            ..Default::default()
        }
    }

    pub fn with_reconnect_delays(mut self, delays: Vec<Duration>) -> Self {
        self.reconnect_delays = delays;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }

    /// Delay before the attempt following `failures` consecutive failures
    pub fn delay_for(&self, failures: usize) -> Duration {
        self.reconnect_delays
            .get(failures)
            .or(self.reconnect_delays.last())
            .copied()
            .unwrap_or(Duration::from_secs(10))
    }
}

/// Connection status updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Disconnected,
}

pub struct RealtimeClient {
    config: RealtimeConfig,
    subscriptions: HashSet<EventName>,
    event_tx: mpsc::Sender<PushEvent>,
    event_rx: mpsc::Receiver<PushEvent>,
    status_tx: mpsc::Sender<ConnectionStatus>,
    status_rx: mpsc::Receiver<ConnectionStatus>,
}

impl RealtimeClient {
    pub fn with_config(config: RealtimeConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.channel_buffer_size);
        let (status_tx, status_rx) = mpsc::channel(10);

        Self {
            config,
            subscriptions: HashSet::new(),
            event_tx,
            event_rx,
            status_tx,
            status_rx,
        }
    }

    /// Register interest in a hub event. Returns false if it was already subscribed.
    pub fn subscribe(&mut self, event: EventName) -> bool {
        self.subscriptions.insert(event)
    }

    pub fn is_subscribed(&self, event: EventName) -> bool {
        self.subscriptions.contains(&event)
    }

    /// Spawn the connection loop.
    ///
    /// Returns a receiver for validated push events and one for connection status updates.
    pub fn start(self) -> (mpsc::Receiver<PushEvent>, mpsc::Receiver<ConnectionStatus>) {
        let config = self.config;
        let subscriptions = self.subscriptions;
        let event_tx = self.event_tx;
        let status_tx = self.status_tx;

        tokio::spawn(async move {
            run_hub_loop(config, subscriptions, event_tx, status_tx).await;
        });

        (self.event_rx, self.status_rx)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NegotiateResponse {
    url: String,
    #[serde(rename = "accessToken")]
    access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct HubNegotiateResponse {
    #[serde(rename = "connectionToken")]
    connection_token: Option<String>,
    #[serde(rename = "connectionId")]
    connection_id: Option<String>,
    url: Option<String>,
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    error: Option<String>,
}

/// Hub frame as it arrives on the wire
#[derive(Debug, Clone, Deserialize)]
struct RawHubMessage {
    #[serde(rename = "type")]
    kind: Option<u8>,
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<serde_json::Value>,
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        target: String,
        arguments: Vec<serde_json::Value>,
    },
    Ping,
    Close {
        error: Option<String>,
    },
    /// Handshake response (`{}` or `{"error": ..}`)
    Handshake {
        error: Option<String>,
    },
    Other(u8),
}

impl HubMessage {
    pub fn parse(frame: &str) -> Result<Self, DashboardError> {
        let raw: RawHubMessage = serde_json::from_str(frame)?;
        Ok(match raw.kind {
            None => HubMessage::Handshake { error: raw.error },
            Some(1) => HubMessage::Invocation {
                target: raw.target.unwrap_or_default(),
                arguments: raw.arguments,
            },
            Some(6) => HubMessage::Ping,
            Some(7) => HubMessage::Close { error: raw.error },
            Some(other) => HubMessage::Other(other),
        })
    }
}

/// Split a text frame into hub messages on the record separator
pub fn split_frames(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|frame| !frame.is_empty())
}

/// `{hub}/negotiate?negotiateVersion=1`, keeping the hub's own query (e.g. `?hub=flow`)
pub fn hub_negotiate_url(hub: &str) -> Result<Url, DashboardError> {
    let mut url = Url::parse(hub).map_err(|e| DashboardError::Negotiate(e.to_string()))?;
    let path = format!("{}/negotiate", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

/// WebSocket URL for a negotiated connection
pub fn websocket_url(hub: &str, connection_token: &str, access_token: &str) -> Result<Url, DashboardError> {
    let mut url = Url::parse(hub).map_err(|e| DashboardError::Negotiate(e.to_string()))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme)
        .map_err(|_| DashboardError::Negotiate(format!("cannot use {scheme} for {hub}")))?;
    url.query_pairs_mut()
        .append_pair("id", connection_token)
        .append_pair("access_token", access_token);
    Ok(url)
}

/// Resolve the hub URL, access token and connection token
async fn negotiate(
    http: &reqwest::Client,
    negotiate_url: &str,
) -> Result<(String, String, String), DashboardError> {
    let response = http
        .get(negotiate_url)
        .timeout(Duration::from_secs(10))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(DashboardError::Status(response.status().as_u16()));
    }
    let body: NegotiateResponse = serde_json::from_str(&response.text().await?)?;

    let mut hub = body.url;
    let mut token = body.access_token;

    // The service may redirect once to another hub endpoint
    for _ in 0..2 {
        let response = http
            .post(hub_negotiate_url(&hub)?)
            .bearer_auth(&token)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DashboardError::Status(response.status().as_u16()));
        }
        let body: HubNegotiateResponse = serde_json::from_str(&response.text().await?)?;

        if let Some(err) = body.error {
            return Err(DashboardError::Negotiate(err));
        }
        if let (Some(url), Some(redirect_token)) = (body.url, body.access_token) {
            debug!("hub negotiate redirected to {}", url);
            hub = url;
            token = redirect_token;
            continue;
        }

        let connection = body
            .connection_token
            .or(body.connection_id)
            .ok_or_else(|| DashboardError::Negotiate("no connection token".to_string()))?;
        return Ok((hub, token, connection));
    }

    Err(DashboardError::Negotiate("too many redirects".to_string()))
}

/// How a connected session ended
enum SessionEnd {
    Dropped,
    ReceiverGone,
}

/// Main hub connection loop with auto-reconnect
async fn run_hub_loop(
    config: RealtimeConfig,
    subscriptions: HashSet<EventName>,
    event_tx: mpsc::Sender<PushEvent>,
    status_tx: mpsc::Sender<ConnectionStatus>,
) {
    info!("Starting realtime client via {}", config.negotiate_url);
    let http = reqwest::Client::new();
    let mut failures = 0usize;

    loop {
        let exhausted = failures >= config.reconnect_delays.len();
        if failures == config.reconnect_delays.len() {
            warn!("reconnect schedule exhausted, still retrying");
            let _ = status_tx.send(ConnectionStatus::Disconnected).await;
        }

        let delay = config.delay_for(failures);
        if !delay.is_zero() {
            debug!("Waiting {:?} before reconnecting...", delay);
            tokio::time::sleep(delay).await;
        }
        if !exhausted {
            let _ = status_tx.send(ConnectionStatus::Reconnecting).await;
        }

        match connect(&http, &config).await {
            Ok((ws_stream, leftover)) => {
                info!("Connected to flow hub");
                let _ = status_tx.send(ConnectionStatus::Connected).await;
                failures = 0;

                match run_session(ws_stream, leftover, &config, &subscriptions, &event_tx).await {
                    SessionEnd::ReceiverGone => {
                        warn!("Event receiver dropped, stopping client");
                        return;
                    }
                    SessionEnd::Dropped => {
                        warn!("Connection closed, will reconnect...");
                    }
                }
            }
            Err(e) => {
                error!("Failed to connect to flow hub: {}", e);
                failures += 1;
            }
        }
    }
}

type HubStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Negotiate, open the socket and complete the handshake. Returns any messages that arrived
/// in the same frame as the handshake response.
async fn connect(
    http: &reqwest::Client,
    config: &RealtimeConfig,
) -> Result<(HubStream, Vec<String>), DashboardError> {
    let (hub, access_token, connection) = negotiate(http, &config.negotiate_url).await?;
    let ws_url = websocket_url(&hub, &connection, &access_token)?;

    let (mut ws_stream, _) = connect_async(ws_url.as_str()).await?;
    ws_stream.send(Message::text(HANDSHAKE.to_string())).await?;

    while let Some(msg) = ws_stream.next().await {
        match msg? {
            Message::Text(text) => {
                let mut frames = split_frames(text.as_str());
                let first = frames
                    .next()
                    .ok_or_else(|| DashboardError::Handshake("empty response".to_string()))?;
                match HubMessage::parse(first)? {
                    HubMessage::Handshake { error: None } => {
                        return Ok((ws_stream, frames.map(str::to_string).collect()));
                    }
                    HubMessage::Handshake { error: Some(err) } => {
                        return Err(DashboardError::Handshake(err))
                    }
                    other => {
                        return Err(DashboardError::Handshake(format!("unexpected {other:?}")))
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Err(DashboardError::Handshake("closed before handshake".to_string()))
}

async fn run_session(
    ws_stream: HubStream,
    leftover: Vec<String>,
    config: &RealtimeConfig,
    subscriptions: &HashSet<EventName>,
    event_tx: &mpsc::Sender<PushEvent>,
) -> SessionEnd {
    let (mut write, mut read) = ws_stream.split();

    // Spawn ping task to keep the hub connection alive
    let ping_interval = config.ping_interval;
    let (ping_shutdown_tx, mut ping_shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ping_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if write.send(Message::text(PING.to_string())).await.is_err() {
                        debug!("Failed to send ping, connection likely dead");
                        break;
                    }
                }
                _ = ping_shutdown_rx.recv() => {
                    debug!("Ping task shutting down");
                    let _ = write.close().await;
                    break;
                }
            }
        }
    });

    let mut end = SessionEnd::Dropped;
    let mut keep_going = true;
    for frame in &leftover {
        if !dispatch_frame(frame, subscriptions, event_tx, &mut end).await {
            keep_going = false;
            break;
        }
    }

    while keep_going {
        let Some(msg) = read.next().await else {
            break;
        };
        match msg {
            Ok(Message::Text(text)) => {
                for frame in split_frames(text.as_str()) {
                    if !dispatch_frame(frame, subscriptions, event_tx, &mut end).await {
                        keep_going = false;
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                info!("Server closed connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        }
    }

    let _ = ping_shutdown_tx.send(()).await;
    end
}

/// Handle one hub message. Returns false when the session should end.
async fn dispatch_frame(
    frame: &str,
    subscriptions: &HashSet<EventName>,
    event_tx: &mpsc::Sender<PushEvent>,
    end: &mut SessionEnd,
) -> bool {
    let message = match HubMessage::parse(frame) {
        Ok(message) => message,
        Err(e) => {
            warn!("Failed to parse hub message: {}", e);
            debug!("Raw frame: {}", frame);
            return true;
        }
    };

    match message {
        HubMessage::Invocation { target, arguments } => {
            let subscribed = EventName::from_target(&target)
                .map(|name| subscriptions.contains(&name))
                .unwrap_or(false);
            if !subscribed {
                debug!("Ignoring hub target {}", target);
                return true;
            }
            let Some(payload) = arguments.into_iter().next() else {
                warn!("Invocation {} without arguments", target);
                return true;
            };
            match PushEvent::decode(&target, payload) {
                Ok(Some(event)) => {
                    if event_tx.send(event).await.is_err() {
                        *end = SessionEnd::ReceiverGone;
                        return false;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Dropping invalid {} payload: {}", target, e),
            }
            true
        }
        HubMessage::Ping | HubMessage::Handshake { .. } | HubMessage::Other(_) => true,
        HubMessage::Close { error } => {
            if let Some(error) = error {
                warn!("Hub closed connection: {}", error);
            }
            false
        }
    }
}
