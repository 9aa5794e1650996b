// Keyboard teleop: W/S linear, A/D turn, R/F speed level, Q quit
use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::info;

use crate::config::TOPIC_CMD_VEL;
use crate::messages::BaseCommand;
use crate::runtime::BoxError;

const LINEAR_SPEEDS: [f32; 3] = [0.1, 0.3, 0.6]; // m/s
const ANGULAR_SPEEDS: [f32; 3] = [0.3, 0.8, 1.5]; // rad/s
const LABELS: [&str; 3] = ["LOW", "MED", "HIGH"];
const INPUT_TIMEOUT: Duration = Duration::from_millis(100); // zero velocities after this
const POLL_INTERVAL: Duration = Duration::from_millis(20); // ~50 Hz publish rate

/// Keyboard state turned into body velocity commands
#[derive(Debug, Default)]
struct Teleop {
    speed_idx: usize,
    command: BaseCommand,
}

enum KeyAction {
    Moved,
    Other,
    Quit,
}

impl Teleop {
    fn on_key(&mut self, code: KeyCode) -> KeyAction {
        let linear = LINEAR_SPEEDS[self.speed_idx];
        let angular = ANGULAR_SPEEDS[self.speed_idx];
        match code {
            KeyCode::Char('w') => self.command.linear = linear,
            KeyCode::Char('s') => self.command.linear = -linear,
            KeyCode::Char('a') => self.command.angular = angular,
            KeyCode::Char('d') => self.command.angular = -angular,
            KeyCode::Char('r') => {
                self.speed_idx = (self.speed_idx + 1).min(LABELS.len() - 1);
                info!("Speed: {}", LABELS[self.speed_idx]);
                return KeyAction::Other;
            }
            KeyCode::Char('f') => {
                self.speed_idx = self.speed_idx.saturating_sub(1);
                info!("Speed: {}", LABELS[self.speed_idx]);
                return KeyAction::Other;
            }
            KeyCode::Char('q') | KeyCode::Esc => return KeyAction::Quit,
            _ => return KeyAction::Other,
        }
        KeyAction::Moved
    }

    fn stop(&mut self) {
        self.command = BaseCommand::default();
    }
}

pub async fn run() -> Result<(), BoxError> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_VEL).await?;

    info!("Controls: W/S=drive, A/D=turn, R/F=speed, Q=quit");
    info!("Speed: {}", LABELS[0]);

    enable_raw_mode()?;
    let result = teleop_loop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn teleop_loop(publisher: &zenoh::pubsub::Publisher<'_>) -> Result<(), BoxError> {
    let mut teleop = Teleop::default();
    let mut last_movement_input = Instant::now();

    loop {
        if event::poll(POLL_INTERVAL)? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                if kind == KeyEventKind::Press || kind == KeyEventKind::Repeat {
                    match teleop.on_key(code) {
                        KeyAction::Moved => last_movement_input = Instant::now(),
                        KeyAction::Other => {}
                        KeyAction::Quit => break,
                    }
                }
            }
        }

        if last_movement_input.elapsed() > INPUT_TIMEOUT {
            teleop.stop();
        }

        publisher.put(serde_json::to_string(&teleop.command)?).await?;
    }

    Ok(())
}
