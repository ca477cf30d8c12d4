//! Rolling flow chart: call/put premium on a volume axis, underlying price on a second axis.
//!
//! The renderer maps the tail of the [`SeriesStore`] onto a braille canvas and keeps the
//! last layout around so pointer positions can be mapped back to samples.

use crate::shared::series::{series_max, series_min, SeriesStore, SeriesWindow, MAX_RENDER_POINTS};
use crate::shared::types::SamplePoint;
use crate::shared::widgets::{C_ACCENT, C_CALL, C_DIM, C_GRID, C_PRICE, C_PUT, C_TEXT};
use chrono::Local;
use ratatui::{
    layout::{Alignment, Rect},
    style::{Modifier, Style},
    symbols::Marker,
    text::{Line, Span},
    widgets::{
        canvas::{Canvas, Context, Line as CanvasLine, Points},
        Block, Borders, Paragraph,
    },
    Frame,
};

/// Minimum half-height of the volume axis, in millions
pub const VOLUME_FLOOR: f64 = 0.5;
/// Multiplier applied to both volume bounds
pub const VOLUME_HEADROOM: f64 = 1.10;
/// Padding added above and below the price range
pub const PRICE_PADDING: f64 = 0.25;
/// At or above this many points lines are drawn straight
pub const SMOOTH_THRESHOLD: usize = 500;
/// Interpolated points per segment for smooth lines
pub const SMOOTH_SUBDIVISIONS: usize = 4;

/// Columns reserved left of the plot for volume labels
const LEFT_GUTTER: u16 = 8;
/// Columns reserved right of the plot for price labels
const RIGHT_GUTTER: u16 = 8;
/// Rows reserved under the plot for time labels
const BOTTOM_GUTTER: u16 = 1;
const MIN_PLOT_WIDTH: u16 = 4;
const MIN_PLOT_HEIGHT: u16 = 3;

/// Linear axis between `lo` and `hi`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisScale {
    pub lo: f64,
    pub hi: f64,
}

impl AxisScale {
    /// Position of `value` on the axis, 0.0 at `lo` and 1.0 at `hi`
    pub fn normalize(&self, value: f64) -> f64 {
        let span = self.hi - self.lo;
        if span.abs() < f64::EPSILON {
            return 0.5;
        }
        (value - self.lo) / span
    }

    pub fn value_at(&self, fraction: f64) -> f64 {
        self.lo + (self.hi - self.lo) * fraction
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisScales {
    pub volume: AxisScale,
    pub price: AxisScale,
}

impl AxisScales {
    /// Compute both axes for a non-empty window
    pub fn for_window(window: &SeriesWindow<'_>) -> Option<Self> {
        let call_min = series_min(window.call_flow())?;
        let call_max = series_max(window.call_flow())?;
        let put_min = series_min(window.put_flow())?;
        let put_max = series_max(window.put_flow())?;
        let price_min = series_min(window.prices())?;
        let price_max = series_max(window.prices())?;

        let lo = put_min.min(call_min).min(-VOLUME_FLOOR);
        let hi = call_max.max(put_max).max(VOLUME_FLOOR);

        Some(Self {
            volume: AxisScale {
                lo: lo * VOLUME_HEADROOM,
                hi: hi * VOLUME_HEADROOM,
            },
            price: AxisScale {
                lo: price_min - PRICE_PADDING,
                hi: price_max + PRICE_PADDING,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStrategy {
    /// Catmull-Rom spline through every point
    Smooth,
    /// One straight segment between consecutive points
    Straight,
}

impl LineStrategy {
    pub fn for_len(points: usize) -> Self {
        if points < SMOOTH_THRESHOLD {
            LineStrategy::Smooth
        } else {
            LineStrategy::Straight
        }
    }
}

/// Catmull-Rom interpolation through `points`, `subdivisions` steps per segment.
/// End segments reuse the endpoint as the missing control point.
pub fn catmull_rom(points: &[(f64, f64)], subdivisions: usize) -> Vec<(f64, f64)> {
    if points.len() < 3 || subdivisions < 2 {
        return points.to_vec();
    }

    let mut out = Vec::with_capacity((points.len() - 1) * subdivisions + 1);
    for i in 0..points.len() - 1 {
        let p0 = points[i.saturating_sub(1)];
        let p1 = points[i];
        let p2 = points[i + 1];
        let p3 = points[(i + 2).min(points.len() - 1)];

        for step in 0..subdivisions {
            let t = step as f64 / subdivisions as f64;
            out.push((spline(p0.0, p1.0, p2.0, p3.0, t), spline(p0.1, p1.1, p2.1, p3.1, t)));
        }
    }
    if let Some(last) = points.last() {
        out.push(*last);
    }
    out
}

fn spline(p0: f64, p1: f64, p2: f64, p3: f64, t: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * (2.0 * p1
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3)
}

/// Geometry of one rendered frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartLayout {
    /// Full widget area including border
    pub area: Rect,
    /// Cells the series are drawn into
    pub plot: Rect,
    /// Store index of the first rendered sample
    pub window_start: usize,
    /// Number of rendered samples
    pub window_len: usize,
    pub scales: AxisScales,
}

impl ChartLayout {
    /// Column of the window-relative sample `index`
    pub fn column_for(&self, index: usize) -> u16 {
        if self.window_len <= 1 || self.plot.width <= 1 {
            return self.plot.x;
        }
        let fraction = index as f64 / (self.window_len - 1) as f64;
        self.plot.x + (fraction * (self.plot.width - 1) as f64).round() as u16
    }

    /// Window-relative sample index under `column`, clamped to the window
    pub fn index_for(&self, column: u16) -> usize {
        if self.window_len <= 1 || self.plot.width <= 1 {
            return 0;
        }
        let offset = column.saturating_sub(self.plot.x).min(self.plot.width - 1);
        let fraction = offset as f64 / (self.plot.width - 1) as f64;
        ((fraction * (self.window_len - 1) as f64).round() as usize).min(self.window_len - 1)
    }

    pub fn contains(&self, column: u16, row: u16) -> bool {
        column >= self.plot.x
            && column < self.plot.x + self.plot.width
            && row >= self.plot.y
            && row < self.plot.y + self.plot.height
    }
}

/// Sample under the pointer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HoverInfo {
    /// Store index
    pub index: usize,
    pub sample: SamplePoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawOutcome {
    NoData,
    TooSmall,
    Drawn { points: usize, strategy: LineStrategy },
}

#[derive(Debug, Clone)]
pub struct ChartRenderer {
    max_points: usize,
    last_layout: Option<ChartLayout>,
}

impl Default for ChartRenderer {
    fn default() -> Self {
        Self::new(MAX_RENDER_POINTS)
    }
}

impl ChartRenderer {
    pub fn new(max_points: usize) -> Self {
        Self {
            max_points: max_points.max(1),
            last_layout: None,
        }
    }

    pub fn last_layout(&self) -> Option<&ChartLayout> {
        self.last_layout.as_ref()
    }

    /// Compute the plot geometry for `area`. `None` when there is nothing to draw or no room.
    pub fn layout(&self, area: Rect, store: &SeriesStore) -> Option<ChartLayout> {
        let window = store.window_slice(self.max_points);
        if window.is_empty() {
            return None;
        }

        let inner = Block::default().borders(Borders::ALL).inner(area);
        let width = inner.width.checked_sub(LEFT_GUTTER + RIGHT_GUTTER)?;
        let height = inner.height.checked_sub(BOTTOM_GUTTER)?;
        if width < MIN_PLOT_WIDTH || height < MIN_PLOT_HEIGHT {
            return None;
        }

        Some(ChartLayout {
            area,
            plot: Rect::new(inner.x + LEFT_GUTTER, inner.y, width, height),
            window_start: window.start(),
            window_len: window.len(),
            scales: AxisScales::for_window(&window)?,
        })
    }

    /// Map a pointer cell to the sample under it.
    ///
    /// The window is recomputed against the current store in the last drawn area, which is
    /// the window the next draw renders. `None` before the first draw.
    pub fn hover_lookup(&self, store: &SeriesStore, column: u16, row: u16) -> Option<HoverInfo> {
        let area = self.last_layout.as_ref()?.area;
        self.hover_in(area, store, column, row)
    }

    /// Pointer lookup against the window `store` renders into `area` right now
    pub fn hover_in(
        &self,
        area: Rect,
        store: &SeriesStore,
        column: u16,
        row: u16,
    ) -> Option<HoverInfo> {
        let layout = self.layout(area, store)?;
        if !layout.contains(column, row) {
            return None;
        }
        let index = layout.window_start + layout.index_for(column);
        store.get(index).map(|sample| HoverInfo { index, sample })
    }

    pub fn draw(
        &mut self,
        frame: &mut Frame,
        area: Rect,
        store: &SeriesStore,
        hover: Option<&HoverInfo>,
    ) -> DrawOutcome {
        let block = Block::default()
            .title(" OPTIONS FLOW ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(C_DIM));

        if store.is_empty() {
            self.last_layout = None;
            let inner = block.inner(area);
            frame.render_widget(block, area);
            let placeholder = Paragraph::new("waiting for data")
                .alignment(Alignment::Center)
                .style(Style::default().fg(C_DIM));
            let row = Rect::new(inner.x, inner.y + inner.height / 2, inner.width, inner.height.min(1));
            frame.render_widget(placeholder, row);
            return DrawOutcome::NoData;
        }

        let Some(layout) = self.layout(area, store) else {
            self.last_layout = None;
            frame.render_widget(block, area);
            return DrawOutcome::TooSmall;
        };
        self.last_layout = Some(layout);
        frame.render_widget(block, area);

        let window = store.window_slice(self.max_points);
        let strategy = LineStrategy::for_len(window.len());
        let scales = layout.scales;

        let calls = normalized(window.call_flow(), &scales.volume);
        let puts = normalized(window.put_flow(), &scales.volume);
        let prices = normalized(window.prices(), &scales.price);
        let zero = scales.volume.normalize(0.0);
        let x_max = (window.len().max(2) - 1) as f64;
        let crosshair = hover
            .and_then(|h| h.index.checked_sub(layout.window_start))
            .filter(|i| *i < window.len())
            .map(|i| i as f64);

        let canvas = Canvas::default()
            .marker(Marker::Braille)
            .x_bounds([0.0, x_max])
            .y_bounds([0.0, 1.0])
            .paint(move |ctx| {
                for level in [0.25, 0.5, 0.75] {
                    ctx.draw(&CanvasLine::new(0.0, level, x_max, level, C_GRID));
                }
                if (0.0..=1.0).contains(&zero) {
                    ctx.draw(&CanvasLine::new(0.0, zero, x_max, zero, C_DIM));
                }
                ctx.layer();

                draw_series(ctx, &prices, strategy, C_PRICE);
                draw_series(ctx, &puts, strategy, C_PUT);
                draw_series(ctx, &calls, strategy, C_CALL);

                if let Some(x) = crosshair {
                    ctx.layer();
                    ctx.draw(&CanvasLine::new(x, 0.0, x, 1.0, C_ACCENT));
                }
            });
        frame.render_widget(canvas, layout.plot);

        draw_axis_labels(frame, &layout);
        draw_time_labels(frame, &layout, &window);

        let shown = hover.map(|h| h.sample).or_else(|| store.latest());
        if let Some(sample) = shown {
            draw_values_box(frame, &layout, &sample, hover.is_some());
        }

        DrawOutcome::Drawn {
            points: window.len(),
            strategy,
        }
    }
}

fn normalized(values: impl Iterator<Item = f64>, scale: &AxisScale) -> Vec<(f64, f64)> {
    values
        .enumerate()
        .map(|(i, v)| (i as f64, scale.normalize(v)))
        .collect()
}

fn draw_series(ctx: &mut Context<'_>, points: &[(f64, f64)], strategy: LineStrategy, color: ratatui::style::Color) {
    if points.len() == 1 {
        ctx.draw(&Points { coords: points, color });
        return;
    }

    let path = match strategy {
        LineStrategy::Smooth => catmull_rom(points, SMOOTH_SUBDIVISIONS),
        LineStrategy::Straight => points.to_vec(),
    };
    for pair in path.windows(2) {
        ctx.draw(&CanvasLine::new(pair[0].0, pair[0].1, pair[1].0, pair[1].1, color));
    }
}

fn draw_axis_labels(frame: &mut Frame, layout: &ChartLayout) {
    let plot = layout.plot;
    let rows = [
        (plot.y, 1.0),
        (plot.y + plot.height / 2, 0.5),
        (plot.y + plot.height - 1, 0.0),
    ];
    let left_x = plot.x.saturating_sub(LEFT_GUTTER);
    let right_x = plot.x + plot.width + 1;
    let style = Style::default().fg(C_DIM);

    let buffer = frame.buffer_mut();
    for (row, fraction) in rows {
        let volume = layout.scales.volume.value_at(fraction);
        let price = layout.scales.price.value_at(fraction);
        buffer.set_string(left_x, row, format!("{:>+6.1}M", volume), style);
        buffer.set_string(right_x, row, format!("{:<7.2}", price), Style::default().fg(C_PRICE));
    }
}

fn draw_time_labels(frame: &mut Frame, layout: &ChartLayout, window: &SeriesWindow<'_>) {
    let row = layout.plot.y + layout.plot.height;
    let last = window.len().saturating_sub(1);
    let style = Style::default().fg(C_DIM);
    let plot_right = layout.plot.x + layout.plot.width;

    let buffer = frame.buffer_mut();
    for index in [0, last / 2, last] {
        let Some(sample) = window.get(index) else {
            continue;
        };
        let label = sample.timestamp.with_timezone(&Local).format("%H:%M").to_string();
        let width = label.len() as u16;
        let column = layout
            .column_for(index)
            .saturating_sub(width / 2)
            .clamp(layout.plot.x, plot_right.saturating_sub(width));
        buffer.set_string(column, row, label, style);
    }
}

fn draw_values_box(frame: &mut Frame, layout: &ChartLayout, sample: &SamplePoint, hovered: bool) {
    let mut spans = Vec::with_capacity(9);
    if hovered {
        spans.push(Span::styled(
            format!("{} ", sample.timestamp.with_timezone(&Local).format("%H:%M:%S")),
            Style::default().fg(C_TEXT).add_modifier(Modifier::BOLD),
        ));
    }
    spans.extend([
        Span::styled("C ", Style::default().fg(C_DIM)),
        Span::styled(format!("{:+.2}M  ", sample.call_flow), Style::default().fg(C_CALL)),
        Span::styled("P ", Style::default().fg(C_DIM)),
        Span::styled(format!("{:+.2}M  ", sample.put_flow), Style::default().fg(C_PUT)),
        Span::styled("Net ", Style::default().fg(C_DIM)),
        Span::styled(format!("{:+.2}M  ", sample.net_flow()), Style::default().fg(C_TEXT)),
        Span::styled(format!("{:.2}", sample.price), Style::default().fg(C_PRICE)),
    ]);

    let line = Line::from(spans);
    let width = (line.width() as u16).min(layout.plot.width);
    let rect = Rect::new(layout.plot.x, layout.plot.y, width, 1);
    frame.render_widget(Paragraph::new(line), rect);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::series::RetentionPolicy;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use ratatui::{backend::TestBackend, Terminal};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 15, 0, 0).unwrap()
    }

    fn store_with(n: usize) -> SeriesStore {
        let mut store = SeriesStore::new(RetentionPolicy::MaxSamples(20_000));
        for i in 0..n {
            store
                .append(SamplePoint::new(
                    t0() + ChronoDuration::seconds(i as i64 * 30),
                    0.1 * i as f64,
                    -0.05 * i as f64,
                    600.0 + (i % 7) as f64 * 0.1,
                ))
                .unwrap();
        }
        store
    }

    fn buffer_text(terminal: &Terminal<TestBackend>) -> String {
        terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn test_volume_axis_floor_and_headroom() {
        let mut store = SeriesStore::default();
        store
            .append(SamplePoint::new(t0(), 0.1, 0.2, 600.0))
            .unwrap();

        let scales = AxisScales::for_window(&store.window_slice(10)).unwrap();
        assert!((scales.volume.lo - -0.55).abs() < 1e-9);
        assert!((scales.volume.hi - 0.55).abs() < 1e-9);
        assert!((scales.price.lo - 599.75).abs() < 1e-9);
        assert!((scales.price.hi - 600.25).abs() < 1e-9);

        store
            .append(SamplePoint::new(t0() + ChronoDuration::minutes(1), 3.0, -2.0, 601.0))
            .unwrap();
        let scales = AxisScales::for_window(&store.window_slice(10)).unwrap();
        assert!((scales.volume.lo - -2.2).abs() < 1e-9);
        assert!((scales.volume.hi - 3.3).abs() < 1e-9);
    }

    #[test]
    fn test_strategy_threshold() {
        assert_eq!(LineStrategy::for_len(2), LineStrategy::Smooth);
        assert_eq!(LineStrategy::for_len(499), LineStrategy::Smooth);
        assert_eq!(LineStrategy::for_len(500), LineStrategy::Straight);
        assert_eq!(LineStrategy::for_len(14_400), LineStrategy::Straight);
    }

    #[test]
    fn test_catmull_rom_passes_through_points() {
        let points = vec![(0.0, 0.0), (1.0, 1.0), (2.0, 0.0), (3.0, 1.0)];
        let path = catmull_rom(&points, 4);
        assert_eq!(path.len(), 3 * 4 + 1);
        for (i, point) in points.iter().enumerate() {
            let on_path = path[i * 4];
            assert!((on_path.0 - point.0).abs() < 1e-9);
            assert!((on_path.1 - point.1).abs() < 1e-9);
        }
    }

    #[test]
    fn test_layout_empty_store() {
        let renderer = ChartRenderer::default();
        assert!(renderer.layout(Rect::new(0, 0, 100, 30), &SeriesStore::default()).is_none());
    }

    #[test]
    fn test_layout_too_small() {
        let renderer = ChartRenderer::default();
        assert!(renderer.layout(Rect::new(0, 0, 12, 30), &store_with(5)).is_none());
        assert!(renderer.layout(Rect::new(0, 0, 100, 4), &store_with(5)).is_none());
    }

    #[test]
    fn test_layout_respects_max_points() {
        let renderer = ChartRenderer::new(100);
        let layout = renderer.layout(Rect::new(0, 0, 120, 40), &store_with(250)).unwrap();
        assert_eq!(layout.window_start, 150);
        assert_eq!(layout.window_len, 100);
    }

    #[test]
    fn test_hover_edges_and_outside() {
        let store = store_with(40);
        let mut renderer = ChartRenderer::default();
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        terminal
            .draw(|f| {
                renderer.draw(f, f.area(), &store, None);
            })
            .unwrap();

        let layout = *renderer.last_layout().unwrap();
        let plot = layout.plot;
        let mid_row = plot.y + 1;

        let first = renderer.hover_lookup(&store, plot.x, mid_row).unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(first.sample, store.first().unwrap());

        let last = renderer
            .hover_lookup(&store, plot.x + plot.width - 1, mid_row)
            .unwrap();
        assert_eq!(last.index, 39);
        assert_eq!(last.sample, store.latest().unwrap());

        assert!(renderer.hover_lookup(&store, plot.x.saturating_sub(1), mid_row).is_none());
        assert!(renderer.hover_lookup(&store, plot.x + plot.width, mid_row).is_none());
        assert!(renderer.hover_lookup(&store, plot.x + 2, plot.y + plot.height).is_none());
    }

    #[test]
    fn test_hover_follows_store_after_draw() {
        let mut store = SeriesStore::new(RetentionPolicy::MaxSamples(480));
        for i in 0..480 {
            store
                .append(SamplePoint::new(t0() + ChronoDuration::seconds(i * 30), i as f64, -0.5, 600.0))
                .unwrap();
        }
        let mut renderer = ChartRenderer::default();
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        terminal
            .draw(|f| {
                renderer.draw(f, f.area(), &store, None);
            })
            .unwrap();
        let plot = renderer.last_layout().unwrap().plot;

        for i in 480..490 {
            store
                .append(SamplePoint::new(t0() + ChronoDuration::seconds(i * 30), i as f64, -0.5, 600.0))
                .unwrap();
        }

        let hover = renderer.hover_lookup(&store, plot.x, plot.y + 1).unwrap();
        assert_eq!(hover.index, 0);
        assert_eq!(hover.sample.call_flow, 10.0);
        assert_eq!(
            renderer.hover_in(Rect::new(0, 0, 100, 30), &store, plot.x, plot.y + 1),
            Some(hover)
        );

        // The redraw with that hover renders the same window and puts the crosshair on it
        terminal
            .draw(|f| {
                renderer.draw(f, f.area(), &store, Some(&hover));
            })
            .unwrap();
        let layout = *renderer.last_layout().unwrap();
        assert_eq!(layout.window_start, 0);
        assert_eq!(store.get(layout.window_start).unwrap().call_flow, 10.0);

        let last = renderer
            .hover_lookup(&store, plot.x + plot.width - 1, plot.y + 1)
            .unwrap();
        assert_eq!(last.sample.call_flow, 489.0);
    }

    #[test]
    fn test_hover_without_layout() {
        let renderer = ChartRenderer::default();
        assert!(renderer.hover_lookup(&store_with(10), 20, 5).is_none());
    }

    #[test]
    fn test_draw_empty_store_placeholder() {
        let mut renderer = ChartRenderer::default();
        let mut terminal = Terminal::new(TestBackend::new(80, 20)).unwrap();
        let mut outcome = None;
        terminal
            .draw(|f| {
                outcome = Some(renderer.draw(f, f.area(), &SeriesStore::default(), None));
            })
            .unwrap();

        assert_eq!(outcome, Some(DrawOutcome::NoData));
        assert!(renderer.last_layout().is_none());
        assert!(buffer_text(&terminal).contains("waiting for data"));
    }

    #[test]
    fn test_draw_reports_strategy() {
        let mut renderer = ChartRenderer::default();
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();

        for (n, expected) in [(10, LineStrategy::Smooth), (600, LineStrategy::Straight)] {
            let store = store_with(n);
            let mut outcome = None;
            terminal
                .draw(|f| {
                    outcome = Some(renderer.draw(f, f.area(), &store, None));
                })
                .unwrap();
            assert_eq!(
                outcome,
                Some(DrawOutcome::Drawn {
                    points: n,
                    strategy: expected
                })
            );
        }
    }
}
