/// Options Flow Monitor
///
/// Rolling cumulative call/put premium flow against the underlying price, with anomaly
/// alerts. Bootstraps from the backend snapshot endpoints, then follows the push hub.
use std::{
    error::Error,
    fs::OpenOptions,
    io,
    path::Path,
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::Utc;
use crossterm::{
    event::{
        DisableMouseCapture, EnableMouseCapture, Event, EventStream, KeyCode, KeyEventKind,
        KeyModifiers, MouseEventKind,
    },
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures::StreamExt;
use options_flow_tui::{
    shared::widgets::{render_anomaly_panel, render_footer, render_header},
    BootstrapData, ChartRenderer, ConnectionStatus, DashboardConfig, DashboardError, EventName,
    FileStorage, LocalStorage, MemoryStorage, OptionType, PersistenceBridge, PushEvent,
    RealtimeClient, RealtimeConfig, RedrawReason, SamplePoint, SessionState, SnapshotLoader,
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    Frame, Terminal,
};
use rustls::crypto::ring::default_provider;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

const TICK: Duration = Duration::from_millis(50);

/// Initialize logging into a file, the terminal belongs to the dashboard
fn init_logging(path: &Path) -> Result<(), Box<dyn Error>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

fn open_storage(config: &DashboardConfig) -> Box<dyn LocalStorage> {
    if !config.persist {
        info!("persistence disabled");
        return Box::new(MemoryStorage::default());
    }

    let dir = match &config.store_dir {
        Some(dir) => Ok(dir.clone()),
        None => FileStorage::default_dir(),
    };
    match dir {
        Ok(dir) => {
            info!("persisting to {}", dir.display());
            Box::new(FileStorage::new(dir))
        }
        Err(err) => {
            warn!(%err, "no storage directory, keeping state in memory");
            Box::new(MemoryStorage::default())
        }
    }
}

fn start_realtime(
    config: &DashboardConfig,
) -> (mpsc::Receiver<PushEvent>, mpsc::Receiver<ConnectionStatus>) {
    let mut client = RealtimeClient::with_config(
        RealtimeConfig::new(config.negotiate_url.clone()).with_channel_buffer_size(10_000),
    );
    for event in EventName::ALL {
        client.subscribe(event);
    }
    client.start()
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_once<T>(rx: &mut Option<oneshot::Receiver<T>>) -> Result<T, oneshot::error::RecvError> {
    match rx {
        Some(rx) => rx.await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = default_provider().install_default();

    let config = DashboardConfig::from_env();
    init_logging(&config.log_file)?;
    info!(
        backend = %config.backend_url,
        negotiate = %config.negotiate_url,
        retention = ?config.retention,
        "starting flow monitor"
    );

    let mut bridge = PersistenceBridge::new(open_storage(&config));
    let mut session = SessionState::from_config(&config);
    if session.restore_from(&mut bridge, Utc::now()) {
        info!(samples = session.series.len(), "resumed from local storage");
    }

    // Setup panic hook to restore terminal on crash
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, DisableMouseCapture);
        original_hook(panic_info);
    }));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Live subscription waits for the snapshot so history lands before pushes
    let mut snapshot_rx: Option<oneshot::Receiver<BootstrapData>> = None;
    let mut reload_rx: Option<oneshot::Receiver<Result<Vec<SamplePoint>, DashboardError>>> = None;
    let mut push_rx = None;
    let mut status_rx = None;
    let loader = match SnapshotLoader::new(&config.backend_url, config.snapshot_hours) {
        Ok(loader) => {
            let (tx, rx) = oneshot::channel();
            let startup = loader.clone();
            tokio::spawn(async move {
                let _ = tx.send(startup.load_all().await);
            });
            snapshot_rx = Some(rx);
            Some(loader)
        }
        Err(err) => {
            session.bootstrap_failed(&err);
            let (events, statuses) = start_realtime(&config);
            push_rx = Some(events);
            status_rx = Some(statuses);
            None
        }
    };

    let mut events = EventStream::new();
    let mut ticker = tokio::time::interval(TICK);
    let mut renderer = ChartRenderer::default();
    let mut pointer: Option<(u16, u16)> = None;

    loop {
        tokio::select! {
            maybe_event = events.next() => match maybe_event {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => break,
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
                    KeyCode::Char('r') => {
                        session.request_redraw(RedrawReason::Reload);
                        // One reload at a time, and only once the startup snapshot landed
                        let idle = reload_rx.is_none() && session.bootstrap_complete();
                        if let Some(loader) = loader.clone().filter(|_| idle) {
                            info!("reloading flow history");
                            let (tx, rx) = oneshot::channel();
                            tokio::spawn(async move {
                                let _ = tx.send(loader.fetch_flow_history().await);
                            });
                            reload_rx = Some(rx);
                        }
                    }
                    _ => {}
                },
                Some(Ok(Event::Mouse(mouse))) => {
                    if matches!(mouse.kind, MouseEventKind::Moved | MouseEventKind::Drag(_)) {
                        pointer = Some((mouse.column, mouse.row));
                        session.request_redraw(RedrawReason::Hover);
                    }
                }
                Some(Ok(Event::Resize(_, _))) => session.request_redraw(RedrawReason::Resize),
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!("terminal event error: {}", e),
                None => break,
            },
            result = recv_once(&mut snapshot_rx) => {
                snapshot_rx = None;
                match result {
                    Ok(data) => session.apply_bootstrap(data, Utc::now(), Instant::now()),
                    Err(_) => session.bootstrap_failed(&DashboardError::Http(
                        "snapshot task ended without a result".to_string(),
                    )),
                }
                let (events, statuses) = start_realtime(&config);
                push_rx = Some(events);
                status_rx = Some(statuses);
            },
            result = recv_once(&mut reload_rx) => {
                reload_rx = None;
                let result = result.unwrap_or_else(|_| {
                    Err(DashboardError::Http("reload task ended without a result".to_string()))
                });
                session.apply_flow_reload(result, Utc::now());
            },
            event = recv_opt(&mut push_rx) => match event {
                Some(event) => session.handle_push(event, Utc::now(), Instant::now()),
                None => {
                    warn!("push channel closed");
                    push_rx = None;
                }
            },
            status = recv_opt(&mut status_rx) => match status {
                Some(status) => session.handle_status(status),
                None => status_rx = None,
            },
            _ = ticker.tick() => {
                let now = Utc::now();
                let tick = Instant::now();
                let actions = session.tick(now, tick);
                if actions.redraw {
                    terminal.draw(|f| ui(f, &session, &mut renderer, pointer))?;
                }
                session.maybe_persist(&mut bridge, now, tick);
            }
        }
    }

    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    if session.persist_now(&mut bridge, Utc::now()) {
        info!(samples = session.series.len(), "saved flow data on exit");
    }
    Ok(())
}

fn ui(
    f: &mut Frame,
    session: &SessionState,
    renderer: &mut ChartRenderer,
    pointer: Option<(u16, u16)>,
) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(12),
            Constraint::Length(13),
            Constraint::Length(1),
        ])
        .split(f.area());

    render_header(f, rows[0], &session.market);

    let hover = pointer.and_then(|(column, row)| renderer.hover_in(rows[1], &session.series, column, row));
    renderer.draw(f, rows[1], &session.series, hover.as_ref());

    let panels = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(rows[2]);
    let view = session.anomalies.view();
    render_anomaly_panel(f, panels[0], OptionType::Call, &view.calls);
    render_anomaly_panel(f, panels[1], OptionType::Put, &view.puts);

    render_footer(
        f,
        rows[3],
        session.status(),
        session.is_simulating(),
        session.series.len(),
    );
}
