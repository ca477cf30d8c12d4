//! Ratatui panels around the chart: price header, anomaly tables, status footer

use ratatui::{
    layout::{Constraint, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
    Frame,
};

use super::market::MarketState;
use super::realtime::ConnectionStatus;
use super::types::{AnomalyRecord, OptionType, Severity};

pub const C_CALL: Color = Color::Rgb(100, 220, 100);
pub const C_PUT: Color = Color::Rgb(220, 100, 100);
pub const C_PRICE: Color = Color::Rgb(100, 180, 220);
pub const C_WARN: Color = Color::Rgb(180, 180, 100);
pub const C_DIM: Color = Color::Rgb(120, 120, 120);
pub const C_GRID: Color = Color::Rgb(60, 60, 60);
pub const C_TEXT: Color = Color::Rgb(220, 220, 220);
pub const C_ACCENT: Color = Color::Rgb(180, 130, 220);

/// Top line: underlying price, change vs previous close, ATM band, session status
pub fn render_header(f: &mut Frame, area: Rect, market: &MarketState) {
    let price = market
        .current_price
        .map(|p| format!("{p:.2}"))
        .unwrap_or_else(|| "--".to_string());

    let (change, change_color) = match market.change_percent {
        Some(pct) if pct >= 0.0 => (format!("▲{pct:+.2}%"), C_CALL),
        Some(pct) => (format!("▼{pct:+.2}%"), C_PUT),
        None => ("--".to_string(), C_DIM),
    };

    let atm = market
        .atm_range
        .map(|r| format!("{:.0}-{:.0}", r.min, r.max))
        .unwrap_or_else(|| "--".to_string());

    let status = market.market_status.map(|s| s.label()).unwrap_or("--");

    let line = Line::from(vec![
        Span::styled("SPY ", Style::default().fg(C_DIM)),
        Span::styled(price, Style::default().fg(C_TEXT).add_modifier(Modifier::BOLD)),
        Span::raw(" "),
        Span::styled(change, Style::default().fg(change_color)),
        Span::styled("  ATM ", Style::default().fg(C_DIM)),
        Span::styled(atm, Style::default().fg(C_PRICE)),
        Span::styled("  Prev ", Style::default().fg(C_DIM)),
        Span::styled(
            market
                .previous_close
                .map(|p| format!("{p:.2}"))
                .unwrap_or_else(|| "--".to_string()),
            Style::default().fg(C_TEXT),
        ),
        Span::styled("  Market ", Style::default().fg(C_DIM)),
        Span::styled(status, Style::default().fg(C_WARN)),
    ]);

    f.render_widget(Paragraph::new(line), area);
}

fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::High => C_PUT,
        Severity::Medium => C_WARN,
        Severity::Low => C_DIM,
    }
}

/// One anomaly table, newest first
pub fn render_anomaly_panel(f: &mut Frame, area: Rect, side: OptionType, rows: &[AnomalyRecord]) {
    let (title, color) = match side {
        OptionType::Call => (" CALL ANOMALIES ", C_CALL),
        OptionType::Put => (" PUT ANOMALIES ", C_PUT),
    };

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(color));

    if rows.is_empty() {
        let inner = block.inner(area);
        f.render_widget(block, area);
        f.render_widget(
            Paragraph::new(Span::styled("no anomalies", Style::default().fg(C_DIM))),
            inner,
        );
        return;
    }

    let body = rows.iter().map(|a| {
        Row::new(vec![
            Cell::from(a.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S").to_string()),
            Cell::from(format!("{:.0}", a.strike)),
            Cell::from(format!("{:.2}", a.mid_price)),
            Cell::from(format!("{:+.1}%", a.deviation_percent)).style(Style::default().fg(color)),
            Cell::from(a.severity.as_str()).style(
                Style::default()
                    .fg(severity_color(a.severity))
                    .add_modifier(Modifier::BOLD),
            ),
        ])
    });

    let header = Row::new(vec!["TIME", "STRIKE", "MID", "DEV", "SEV"])
        .style(Style::default().fg(C_DIM));

    let table = Table::new(
        body,
        [
            Constraint::Length(9),
            Constraint::Length(7),
            Constraint::Length(7),
            Constraint::Length(8),
            Constraint::Length(5),
        ],
    )
    .header(header)
    .block(block);

    f.render_widget(table, area);
}

/// Bottom line: connection state, sample count, key hints
pub fn render_footer(
    f: &mut Frame,
    area: Rect,
    status: ConnectionStatus,
    simulating: bool,
    samples: usize,
) {
    let (label, color) = if simulating {
        ("SIMULATED", C_WARN)
    } else {
        match status {
            ConnectionStatus::Connected => ("CONNECTED", C_CALL),
            ConnectionStatus::Reconnecting => ("RECONNECTING", C_WARN),
            ConnectionStatus::Disconnected => ("DISCONNECTED", C_PUT),
        }
    };

    let line = Line::from(vec![
        Span::styled("Status: ", Style::default().fg(C_DIM)),
        Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
        Span::raw("  |  "),
        Span::styled(format!("{samples} samples"), Style::default().fg(C_DIM)),
        Span::raw("  |  "),
        Span::styled("'r' reload  'q' quit", Style::default().fg(C_DIM)),
    ]);

    f.render_widget(Paragraph::new(line), area);
}
