//! Live rowing dashboard.
//!
//! Usage:
//!   cargo run --bin tui                          # scan for the first FTMS rower
//!   cargo run --bin tui -- --address AA:BB:…     # connect to a known rower
//!
//! Keys
//! ----
//!   o        open (connect, or reconnect after a disconnect)
//!   c        close the connection
//!   r        reset the rower's counters
//!   q / Esc  quit

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph, Sparkline},
    Frame, Terminal,
};
use tokio::sync::mpsc;

use rower_link::ble::BleGateway;
use rower_link::cli::GatewayArgs;
use rower_link::gateway::channel;
use rower_link::rower_client::{RowerClient, RowerClientConfig};
use rower_link::types::{MeasurementSnapshot, RowerEvent};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Power samples kept for the sparkline, one per measurement frame.
const POWER_HISTORY: usize = 240;

/// Advisories shown at once; older ones scroll off.
const MAX_ADVISORIES: usize = 6;

/// Braille spinner frames cycled at ~100 ms intervals while connecting.
const SPINNER: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

// ── App state ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AppMode {
    /// `open` sent, waiting for telemetry.
    Connecting,
    Connected,
    /// Closed by the user.
    Idle,
    /// The client gave up or the link dropped.
    Disconnected,
}

struct App {
    mode: AppMode,
    snapshot: MeasurementSnapshot,
    battery: Option<u8>,
    power: VecDeque<u64>,
    advisories: VecDeque<(Instant, String)>,
    frames: u64,
    reset_pending: bool,
}

impl App {
    fn new() -> Self {
        Self {
            mode: AppMode::Connecting,
            snapshot: MeasurementSnapshot::default(),
            battery: None,
            power: VecDeque::with_capacity(POWER_HISTORY),
            advisories: VecDeque::with_capacity(MAX_ADVISORIES),
            frames: 0,
            reset_pending: false,
        }
    }

    fn apply(&mut self, event: RowerEvent) {
        match event {
            RowerEvent::Connected => self.mode = AppMode::Connected,
            RowerEvent::Disconnected => self.mode = AppMode::Disconnected,
            RowerEvent::Measurement(m) => {
                self.snapshot = m;
                self.frames += 1;
                self.reset_pending = false;
                if self.power.len() == POWER_HISTORY {
                    self.power.pop_front();
                }
                self.power.push_back(m.power.max(0) as u64);
            }
            RowerEvent::Advisory(advisory) => {
                if self.advisories.len() == MAX_ADVISORIES {
                    self.advisories.pop_front();
                }
                self.advisories.push_back((Instant::now(), advisory.to_string()));
            }
            RowerEvent::BatteryLevel(level) => self.battery = Some(level),
        }
    }

    fn reset(&mut self) {
        self.snapshot = MeasurementSnapshot::default();
        self.power.clear();
        self.reset_pending = true;
    }
}

/// `m:ss` per 500 m for a speed in cm/s.
fn pace(speed: u32) -> String {
    if speed == 0 {
        return "–:––".into();
    }
    let secs = 500 * 100 / speed;
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// `h:mm:ss` or `m:ss`.
fn clock(secs: u32) -> String {
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m}:{s:02}")
    }
}

// ── Rendering ─────────────────────────────────────────────────────────────────

fn draw(frame: &mut Frame, app: &App) {
    let root = Layout::vertical([
        Constraint::Length(3),
        Constraint::Length(9),
        Constraint::Min(4),
        Constraint::Length(3),
    ])
    .split(frame.area());

    draw_header(frame, root[0], app);
    draw_metrics(frame, root[1], app);
    draw_advisories(frame, root[2], app);
    draw_footer(frame, root[3]);
}

fn spinner_str() -> &'static str {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    SPINNER[(ms / 100) as usize % SPINNER.len()]
}

fn draw_header(frame: &mut Frame, area: Rect, app: &App) {
    let (label, color) = match app.mode {
        AppMode::Connecting => (format!("{} Connecting…", spinner_str()), Color::Yellow),
        AppMode::Connected => ("● Connected".to_owned(), Color::Green),
        AppMode::Idle => ("○ Closed".to_owned(), Color::DarkGray),
        AppMode::Disconnected => ("✕ Disconnected".to_owned(), Color::Red),
    };
    let battery = app
        .battery
        .map(|b| format!("Bat {b}%"))
        .unwrap_or_else(|| "Bat N/A".into());
    let battery_color = match app.battery {
        Some(b) if b <= 25 => Color::Red,
        _ => Color::White,
    };

    let mut spans = vec![
        Span::styled(
            " ROWER ",
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
        sep(),
        Span::styled(label, Style::default().fg(color).add_modifier(Modifier::BOLD)),
        sep(),
        Span::styled(battery, Style::default().fg(battery_color)),
        sep(),
        Span::styled(
            format!("{} frames", app.frames),
            Style::default().fg(Color::DarkGray),
        ),
    ];
    if app.reset_pending {
        spans.push(sep());
        spans.push(Span::styled(
            format!("{} resetting", spinner_str()),
            Style::default().fg(Color::Yellow),
        ));
    }

    frame.render_widget(
        Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

fn sep<'a>() -> Span<'a> {
    Span::styled(" │ ", Style::default().fg(Color::DarkGray))
}

fn metric<'a>(name: &'a str, value: String, unit: &'a str) -> Line<'a> {
    Line::from(vec![
        Span::styled(format!(" {name:<10}"), Style::default().fg(Color::DarkGray)),
        Span::styled(
            format!("{value:>9}"),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::styled(format!(" {unit}"), Style::default().fg(Color::DarkGray)),
    ])
}

fn draw_metrics(frame: &mut Frame, area: Rect, app: &App) {
    let cols = Layout::horizontal([Constraint::Length(34), Constraint::Min(0)]).split(area);
    let s = &app.snapshot;

    let lines = vec![
        metric("Distance", s.distance.to_string(), "m"),
        metric("Time", clock(s.duration), ""),
        metric("Pace", pace(s.speed), "/500m"),
        metric("Strokes", format!("{} @ {:.1}", s.strokes, s.stroke_rate), "spm"),
        metric("Power", s.power.to_string(), "W"),
        metric(
            "Pulse",
            if s.pulse == 0 { "–".into() } else { s.pulse.to_string() },
            "bpm",
        ),
        metric("Energy", s.energy.to_string(), "kcal"),
    ];
    frame.render_widget(
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" Workout ")),
        cols[0],
    );

    let history: Vec<u64> = app.power.iter().copied().collect();
    frame.render_widget(
        Sparkline::default()
            .block(Block::default().borders(Borders::ALL).title(" Power "))
            .data(&history)
            .style(Style::default().fg(Color::Green)),
        cols[1],
    );
}

fn draw_advisories(frame: &mut Frame, area: Rect, app: &App) {
    let items: Vec<ListItem> = app
        .advisories
        .iter()
        .rev()
        .map(|(at, text)| {
            let age = at.elapsed().as_secs();
            ListItem::new(Line::from(vec![
                Span::styled(format!(" {age:>4}s ago  "), Style::default().fg(Color::DarkGray)),
                Span::styled(text.clone(), Style::default().fg(Color::Yellow)),
            ]))
        })
        .collect();

    frame.render_widget(
        List::new(items).block(Block::default().borders(Borders::ALL).title(" Messages ")),
        area,
    );
}

fn draw_footer(frame: &mut Frame, area: Rect) {
    let keys = Line::from(vec![
        Span::raw(" "),
        key("[o]"),
        Span::raw("Open  "),
        key("[c]"),
        Span::raw("Close  "),
        key("[r]"),
        Span::raw("Reset  "),
        key("[q]"),
        Span::raw("Quit"),
    ]);
    frame.render_widget(
        Paragraph::new(keys).block(Block::default().borders(Borders::ALL)),
        area,
    );
}

fn key(s: &str) -> Span<'_> {
    Span::styled(
        s,
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    )
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    use std::io::IsTerminal as _;
    let args = GatewayArgs::parse();
    if !io::stdout().is_terminal() {
        eprintln!("Error: rower-link tui requires a real terminal (TTY).");
        eprintln!("Run it directly in a terminal emulator, not piped or redirected.");
        std::process::exit(1);
    }

    // ── Logging ─────────────────────────────────────────────────────────────
    // Logs go to rower-tui.log in the current directory so they never
    // interfere with the display.  RUST_LOG=debug shows every frame.
    {
        use std::fs::File;
        if let Ok(file) = File::create("rower-tui.log") {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .target(env_logger::Target::Pipe(Box::new(file)))
                .init();
        }
    }

    // ── Client ────────────────────────────────────────────────────────────────
    let (sink, inbox) = channel();
    let gateway = BleGateway::new(args.into(), sink.clone()).await?;
    let (mut rx, handle) =
        RowerClient::new(RowerClientConfig::default()).start(gateway, sink, inbox);
    handle.open();

    let mut app = App::new();

    // ── Terminal setup ────────────────────────────────────────────────────────
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
    let tick = Duration::from_millis(33); // ~30 FPS

    // ── Main loop ─────────────────────────────────────────────────────────────
    'main: loop {
        loop {
            match rx.try_recv() {
                Ok(event) => app.apply(event),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => break 'main,
            }
        }

        terminal.draw(|f| draw(f, &app))?;

        if !event::poll(tick)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };

        // In raw mode Ctrl+C arrives as a key event, not SIGINT.
        let ctrl_c =
            key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c');
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break 'main,
            _ if ctrl_c => break 'main,
            KeyCode::Char('o') => {
                if matches!(app.mode, AppMode::Idle | AppMode::Disconnected) {
                    app.mode = AppMode::Connecting;
                }
                handle.open();
            }
            KeyCode::Char('c') => {
                app.mode = AppMode::Idle;
                handle.close();
            }
            KeyCode::Char('r') => {
                app.reset();
                handle.reset();
            }
            _ => {}
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    handle.shutdown().await;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
