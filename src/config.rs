// Loop periods, topics, storage layout, actuator constants
use std::time::Duration;

// Control task period (fixed-step integration uses the same value)
pub const CONTROL_PERIOD_MS: u32 = 10;
pub const CONTROL_PERIOD: Duration = Duration::from_millis(CONTROL_PERIOD_MS as u64);
pub const CONTROL_DT: f32 = CONTROL_PERIOD_MS as f32 / 1000.0;

// Telemetry publish frequency of the runtime loop
pub const TELEMETRY_HZ: u64 = 50;

// Zenoh topics
pub const TOPIC_CMD_VEL: &str = "drive/cmd_vel"; // commands
pub const TOPIC_RESET_ODOM: &str = "drive/reset_odom"; // odometry reset requests
pub const TOPIC_ODOM: &str = "drive/odom"; // pose/velocity estimate
pub const TOPIC_WHEEL_STATES: &str = "drive/wheel_states"; // per-wheel telemetry
pub const TOPIC_HEALTH: &str = "drive/state/health"; // health status

// Persistent configuration record
pub const CONFIG_ADDRESS: u64 = 0;
pub const CONFIG_LOAD_ATTEMPTS: u32 = 3;
pub const DEFAULT_STORAGE_PATH: &str = "diff-drive.eeprom";

// Wheel effort = applied power * EFFORT_GAIN (zero power stays exactly zero)
pub const EFFORT_GAIN: f32 = -0.1;

// Wheel order used by every four-element array: FL, RL, FR, RR
pub const WHEEL_NAMES: [&str; 4] = ["wheel_FL", "wheel_RL", "wheel_FR", "wheel_RR"];

// Velocity response of simulated wheels
pub const SIM_WHEEL_TIME_CONSTANT_MS: f32 = 30.0;
