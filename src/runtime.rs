// 50 Hz telemetry loop around the drive controller
// Commands arrive over zenoh and go straight to the controller; the
// controller's own watchdog stops the base if they dry up. This loop only
// publishes odometry, wheel states and a health flag.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::config::{
    SIM_WHEEL_TIME_CONSTANT_MS, TELEMETRY_HZ, TOPIC_CMD_VEL, TOPIC_HEALTH, TOPIC_ODOM,
    TOPIC_RESET_ODOM, TOPIC_WHEEL_STATES,
};
use crate::controller::{DiffDriveController, Wheels};
use crate::messages::{BaseCommand, OdomMessage, RuntimeHealth, WheelStatesMessage};
use crate::motor::feetech::{self, STEPS_PER_REVOLUTION};
use crate::motor::{FeetechBus, FeetechError, SimWheel, WheelActuator};
use crate::params::{DriveParams, Parameters};
use crate::store::{ConfigRecord, ConfigStore, FileStorage};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handle for swapping the process-wide log filter after startup
pub type LogReload = reload::Handle<EnvFilter, Registry>;

/// `RUST_LOG` with `level` as the default directive
pub fn log_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::from_default_env().add_directive(level.into())
}

/// Default log level requested by the calibration record
pub fn log_level(record: &ConfigRecord) -> LevelFilter {
    if record.debug_logging {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

/// Raise the log level to debug when the record asks for it
fn apply_log_level(handle: &LogReload, record: &ConfigRecord) {
    if !record.debug_logging {
        return;
    }
    match handle.reload(log_filter(log_level(record))) {
        Ok(()) => debug!("debug_logging is set, log level raised to debug"),
        Err(e) => warn!("Failed to raise log level: {}", e),
    }
}

/// Everything `run` needs to bring the base up
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub params: Parameters,
    pub storage_path: PathBuf,
    /// Servo bus serial port, `None` runs simulated wheels
    pub port: Option<String>,
    /// Lets the stored `debug_logging` flag change the log level
    pub log_reload: Option<LogReload>,
}

/// Tracks command freshness for the health topic
pub struct Runtime {
    cmd_received_at: Option<Instant>,
    input_timeout: Option<Duration>,
    health: RuntimeHealth,
}

impl Runtime {
    pub fn new(input_timeout: Option<Duration>) -> Self {
        Self {
            cmd_received_at: None,
            input_timeout,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    /// Forward an incoming command to the controller
    fn on_command(&mut self, cmd: BaseCommand, controller: &DiffDriveController) {
        debug!("Received command: {:?}", &cmd);
        controller.set_speed(cmd.linear, cmd.angular);
        self.cmd_received_at = Some(Instant::now());
    }

    /// Recompute health from the age of the last command
    fn update_health(&mut self) -> RuntimeHealth {
        let fresh = match (self.cmd_received_at, self.input_timeout) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(at), Some(timeout)) => at.elapsed() <= timeout,
        };

        let health = if fresh {
            RuntimeHealth::Ok
        } else {
            RuntimeHealth::CmdStale
        };
        if health == RuntimeHealth::CmdStale && self.health == RuntimeHealth::Ok {
            warn!("Command stream went stale");
        }
        self.health = health;
        health
    }
}

/// Build the four actuators in order [FL, RL, FR, RR]
///
/// Left wheels are mounted mirrored, so their servos run reversed.
pub fn build_wheels(params: &Parameters, port: Option<&str>) -> Result<Wheels, FeetechError> {
    let Some(port) = port else {
        info!("No servo port given, using simulated wheels");
        return Ok(std::array::from_fn(|_| {
            Box::new(
                SimWheel::new(params.motor_max_speed, params.motor_power_limit)
                    .with_time_constant(SIM_WHEEL_TIME_CONSTANT_MS),
            ) as Box<dyn WheelActuator>
        }));
    };

    if params.motor_encoder_resolution != STEPS_PER_REVOLUTION as f32 {
        warn!(
            "motor_encoder_resolution is {} but servos count {} steps per revolution",
            params.motor_encoder_resolution, STEPS_PER_REVOLUTION
        );
    }

    let bus = FeetechBus::open(port)?;
    let [fl, rl, fr, rr] = params.motor_ids;
    let wheels = feetech::spawn_wheels(bus, [(fl, true), (rl, true), (fr, false), (rr, false)])?;
    Ok(wheels.map(|wheel| Box::new(wheel) as Box<dyn WheelActuator>))
}

pub async fn run(options: RunOptions) -> Result<(), BoxError> {
    let params = options.params;

    let mut config = ConfigStore::new(FileStorage::new(&options.storage_path));
    config.load();
    let record = config.record();
    if let Some(handle) = &options.log_reload {
        apply_log_level(handle, &record);
    }
    info!(
        "Calibration: imu_enabled={}, gps_enabled={}",
        record.imu_enabled, record.gps_enabled
    );

    let wheels = build_wheels(&params, options.port.as_deref())?;
    let drive_params = DriveParams::from(&params);
    let mut controller = DiffDriveController::new(drive_params, wheels);
    controller.start()?;

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_cmd = session.declare_subscriber(TOPIC_CMD_VEL).await?;
    let sub_reset = session.declare_subscriber(TOPIC_RESET_ODOM).await?;
    let pub_odom = session.declare_publisher(TOPIC_ODOM).await?;
    let pub_wheels = session.declare_publisher(TOPIC_WHEEL_STATES).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut runtime = Runtime::new(drive_params.input_timeout);
    let mut tick = interval(Duration::from_millis(1000 / TELEMETRY_HZ));
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("Runtime started: {}Hz telemetry", TELEMETRY_HZ);
    info!("Subscribed to: {}, {}", TOPIC_CMD_VEL, TOPIC_RESET_ODOM);
    info!(
        "Publishing to: {}, {}, {}",
        TOPIC_ODOM, TOPIC_WHEEL_STATES, TOPIC_HEALTH
    );

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }

        // 1. Drain pending commands (non-blocking); each one goes to the controller
        while let Ok(Some(sample)) = sub_cmd.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<BaseCommand>(&payload) {
                Ok(cmd) => runtime.on_command(cmd, &controller),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }

        // 2. Any message on the reset topic resets the pose
        let mut reset_requested = false;
        while let Ok(Some(_)) = sub_reset.try_recv() {
            reset_requested = true;
        }
        if reset_requested {
            controller.reset_odom();
        }

        // 3. Publish telemetry
        let odom = OdomMessage::new(controller.odom(), &params);
        pub_odom.put(serde_json::to_string(&odom)?).await?;

        let wheels = WheelStatesMessage::from(controller.wheel_states());
        pub_wheels.put(serde_json::to_string(&wheels)?).await?;

        // 4. Publish health
        let health = runtime.update_health();
        pub_health.put(serde_json::to_string(&health)?).await?;
    }

    controller.set_speed(0.0, 0.0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_health_follows_command_age() {
        let controller = DiffDriveController::new(
            DriveParams::default(),
            build_wheels(&Parameters::default(), None).unwrap(),
        );
        let mut runtime = Runtime::new(Some(Duration::from_millis(500)));
        assert_eq!(runtime.update_health(), RuntimeHealth::CmdStale);

        runtime.on_command(BaseCommand { linear: 0.2, angular: 0.0 }, &controller);
        assert_eq!(runtime.update_health(), RuntimeHealth::Ok);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(runtime.update_health(), RuntimeHealth::CmdStale);
    }

    #[tokio::test]
    async fn test_health_without_timeout() {
        let controller = DiffDriveController::new(
            DriveParams::default(),
            build_wheels(&Parameters::default(), None).unwrap(),
        );
        let mut runtime = Runtime::new(None);
        assert_eq!(runtime.update_health(), RuntimeHealth::CmdStale);
        runtime.on_command(BaseCommand::default(), &controller);
        assert_eq!(runtime.update_health(), RuntimeHealth::Ok);
    }

    #[test]
    fn test_debug_logging_raises_log_level() {
        let (_layer, handle): (_, LogReload) = reload::Layer::new(log_filter(LevelFilter::INFO));
        let quiet = ConfigRecord::default();
        assert_eq!(log_level(&quiet), LevelFilter::INFO);

        let verbose = ConfigRecord {
            debug_logging: true,
            ..Default::default()
        };
        assert_eq!(log_level(&verbose), LevelFilter::DEBUG);

        apply_log_level(&handle, &verbose);
        let hint = handle.with_current(|filter| filter.max_level_hint()).unwrap();
        assert!(hint >= Some(LevelFilter::DEBUG), "hint = {:?}", hint);
    }
}
