//! Garage door simulator - terminal presentation of the published door state
//!
//! Subscribes to the state topic and animates the door toward the last
//! reported position, 5 units per frame at 30 fps over a 400-unit travel.
//! Press 'q' to quit.

use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use garage_door::infra::Config;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, Paragraph},
    Frame, Terminal,
};
use rumqttc::{AsyncClient, Event as MqttEvent, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Full door travel in animation units
const DOOR_TRAVEL: u16 = 400;
/// Units moved per frame
const DOOR_STEP: u16 = 5;
/// ~30 fps
const FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Garage door simulator
#[derive(Parser, Debug)]
#[command(name = "garage-simulator", version, about)]
struct Args {
    /// Controller config (broker address and state topic are read from it)
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Override the broker host
    #[arg(long)]
    host: Option<String>,

    /// Override the broker port
    #[arg(long)]
    port: Option<u16>,
}

/// Payload on the state topic
#[derive(Debug, Clone, Deserialize)]
struct StateMessage {
    door_open: bool,
    #[serde(default)]
    timestamp: Option<String>,
}

/// Door position, stepped once per frame toward the target
#[derive(Debug, Default)]
struct DoorAnimation {
    /// 0 = closed, DOOR_TRAVEL = fully open
    height: u16,
    target_open: bool,
}

impl DoorAnimation {
    fn set_target(&mut self, open: bool) {
        self.target_open = open;
    }

    fn step(&mut self) {
        if self.target_open {
            self.height = (self.height + DOOR_STEP).min(DOOR_TRAVEL);
        } else {
            self.height = self.height.saturating_sub(DOOR_STEP);
        }
    }

    fn is_moving(&self) -> bool {
        (self.target_open && self.height < DOOR_TRAVEL) || (!self.target_open && self.height > 0)
    }

    fn label(&self) -> &'static str {
        match (self.target_open, self.is_moving()) {
            (true, true) => "OPENING",
            (true, false) => "OPEN",
            (false, true) => "CLOSING",
            (false, false) => "CLOSED",
        }
    }

    fn ratio(&self) -> f64 {
        f64::from(self.height) / f64::from(DOOR_TRAVEL)
    }
}

#[derive(Debug, Default)]
struct SimState {
    connected: bool,
    door: DoorAnimation,
    last_timestamp: Option<String>,
    updates_received: u64,
    last_message: Option<Instant>,
}

impl SimState {
    fn apply(&mut self, message: StateMessage) {
        self.door.set_target(message.door_open);
        self.last_timestamp = message.timestamp;
        self.updates_received += 1;
        self.last_message = Some(Instant::now());
    }
}

type SharedState = Arc<Mutex<SimState>>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load_from_path(&args.config);
    let host = args.host.unwrap_or_else(|| config.mqtt_host().to_string());
    let port = args.port.unwrap_or(config.mqtt_port());
    let topic = config.state_topic().to_string();
    let credentials = config
        .mqtt_username()
        .zip(config.mqtt_password())
        .map(|(u, p)| (u.to_string(), p.to_string()));

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let state = Arc::new(Mutex::new(SimState::default()));

    let mqtt_state = state.clone();
    let mqtt_topic = topic.clone();
    let mqtt_handle = tokio::spawn(async move {
        run_mqtt_subscriber(&host, port, credentials, &mqtt_topic, mqtt_state).await;
    });

    let result = run_ui(&mut terminal, state, &topic).await;

    mqtt_handle.abort();
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

async fn run_mqtt_subscriber(
    host: &str,
    port: u16,
    credentials: Option<(String, String)>,
    topic: &str,
    state: SharedState,
) {
    let client_id = format!("garage_simulator-{}", std::process::id());
    let mut mqttoptions = MqttOptions::new(client_id, host, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    mqttoptions.set_clean_session(true);

    if let Some((user, pass)) = credentials {
        mqttoptions.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    loop {
        match eventloop.poll().await {
            Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                let _ = client.try_subscribe(topic, QoS::AtLeastOnce);
                state.lock().await.connected = true;
            }
            Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                if publish.topic != topic {
                    continue;
                }
                if let Ok(message) = serde_json::from_slice::<StateMessage>(&publish.payload) {
                    state.lock().await.apply(message);
                }
            }
            Ok(_) => {}
            Err(_) => {
                state.lock().await.connected = false;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn run_ui(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    state: SharedState,
    topic: &str,
) -> anyhow::Result<()> {
    let mut last_frame = Instant::now();

    loop {
        {
            let mut s = state.lock().await;
            if last_frame.elapsed() >= FRAME_INTERVAL {
                s.door.step();
                last_frame = Instant::now();
            }
            terminal.draw(|f| draw_ui(f, &s, topic))?;
        }

        let timeout = FRAME_INTERVAL.saturating_sub(last_frame.elapsed());
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                        _ => {}
                    }
                }
            }
        }
    }
}

fn draw_ui(f: &mut Frame, state: &SimState, topic: &str) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(6),    // Door
            Constraint::Length(4), // Details
        ])
        .split(f.area());

    draw_header(f, chunks[0], state, topic);
    draw_door(f, chunks[1], state);
    draw_details(f, chunks[2], state);
}

fn draw_header(f: &mut Frame, area: Rect, state: &SimState, topic: &str) {
    let status_color = if state.connected { Color::Green } else { Color::Red };
    let status_text = if state.connected { "CONNECTED" } else { "DISCONNECTED" };

    let header = Paragraph::new(Line::from(vec![
        Span::styled(
            "Garage Simulator ",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        Span::raw("| "),
        Span::styled(status_text, Style::default().fg(status_color)),
        Span::raw(format!(" | {topic} | Press 'q' to quit")),
    ]))
    .block(Block::default().borders(Borders::ALL));

    f.render_widget(header, area);
}

fn draw_door(f: &mut Frame, area: Rect, state: &SimState) {
    let color = match state.door.label() {
        "OPEN" => Color::Green,
        "CLOSED" => Color::Gray,
        _ => Color::Yellow,
    };

    let gauge = Gauge::default()
        .block(Block::default().title(" Door ").borders(Borders::ALL))
        .gauge_style(Style::default().fg(color).bg(Color::Black))
        .ratio(state.door.ratio())
        .label(format!("{} {}/{}", state.door.label(), state.door.height, DOOR_TRAVEL));

    f.render_widget(gauge, area);
}

fn draw_details(f: &mut Frame, area: Rect, state: &SimState) {
    let last = state
        .last_message
        .map(|t| format!("{}s ago", t.elapsed().as_secs()))
        .unwrap_or_else(|| "never".to_string());

    let details = Paragraph::new(vec![
        Line::from(format!(
            "Updates: {}  Last: {}",
            state.updates_received, last
        )),
        Line::from(format!(
            "Reported at: {}",
            state.last_timestamp.as_deref().unwrap_or("-")
        )),
    ])
    .block(Block::default().borders(Borders::ALL));

    f.render_widget(details, area);
}
