// Tunable parameters loaded from a JSON file
//
// Every field has a default, so a missing file or a partial file is fine.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Error types for parameter loading
#[derive(Debug, thiserror::Error)]
pub enum ParamsError {
    #[error("Failed to read parameter file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse parameter file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Flat parameter namespace for the drive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    // Frames
    pub robot_frame_id: String,
    pub odom_frame_id: String,
    pub imu_frame_id: String,
    pub gps_frame_id: String,

    // Motor
    pub motor_encoder_resolution: f32,
    pub motor_max_speed: f32,
    pub motor_power_limit: f32,
    pub motor_ids: [u8; 4], // [FL, RL, FR, RR]

    // Differential drive
    pub dd_wheel_radius: f32,
    pub dd_wheel_separation: f32,
    pub dd_angular_velocity_multiplier: f32,
    pub dd_input_timeout: f32, // ms, 0 disables the watchdog
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            robot_frame_id: "base_link".to_string(),
            odom_frame_id: "odom".to_string(),
            imu_frame_id: "imu".to_string(),
            gps_frame_id: "gps".to_string(),
            motor_encoder_resolution: 878.4,
            motor_max_speed: 800.0,
            motor_power_limit: 1000.0,
            motor_ids: [1, 2, 3, 4],
            dd_wheel_radius: 0.0625,
            dd_wheel_separation: 0.33,
            dd_angular_velocity_multiplier: 1.91,
            dd_input_timeout: 500.0,
        }
    }
}

impl Parameters {
    /// Parse parameters from a JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Load parameters from a JSON file
    pub fn load(path: &Path) -> Result<Self, ParamsError> {
        let shown = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ParamsError::Read {
            path: shown.clone(),
            source,
        })?;
        let params = Self::from_json(&text).map_err(|source| ParamsError::Parse {
            path: shown.clone(),
            source,
        })?;
        info!("Loaded parameters from {}", shown);
        Ok(params)
    }

    /// Load parameters if a path is given and the file exists, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ParamsError> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => {
                warn!("Parameter file {} not found, using defaults", p.display());
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Command silence timeout, `None` when the watchdog is disabled
    pub fn input_timeout(&self) -> Option<Duration> {
        if self.dd_input_timeout > 0.0 {
            Some(Duration::from_micros((self.dd_input_timeout * 1000.0) as u64))
        } else {
            None
        }
    }
}

/// Kinematic parameters, fixed for a control session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriveParams {
    pub wheel_radius: f32,                // m
    pub wheel_separation: f32,            // m
    pub angular_velocity_multiplier: f32, // compensates track slip
    pub encoder_resolution: f32,          // ticks per wheel revolution
    pub input_timeout: Option<Duration>,
}

impl Default for DriveParams {
    fn default() -> Self {
        Self::from(&Parameters::default())
    }
}

impl From<&Parameters> for DriveParams {
    fn from(params: &Parameters) -> Self {
        Self {
            wheel_radius: params.dd_wheel_radius,
            wheel_separation: params.dd_wheel_separation,
            angular_velocity_multiplier: params.dd_angular_velocity_multiplier,
            encoder_resolution: params.motor_encoder_resolution,
            input_timeout: params.input_timeout(),
        }
    }
}
