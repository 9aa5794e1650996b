// Message types exchanged with the supervisor over zenoh (JSON payloads)

use serde::{Deserialize, Serialize};

use crate::config::WHEEL_NAMES;
use crate::odometry::{Odometry, WheelStates};
use crate::params::Parameters;

// Command from teleop/supervisor -> runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BaseCommand {
    pub linear: f32,  // m/s
    pub angular: f32, // rad/s
}

/// Odometry published by the runtime, tagged with its frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdomMessage {
    pub frame_id: String,
    pub child_frame_id: String,
    #[serde(flatten)]
    pub odom: Odometry,
}

impl OdomMessage {
    pub fn new(odom: Odometry, params: &Parameters) -> Self {
        Self {
            frame_id: params.odom_frame_id.clone(),
            child_frame_id: params.robot_frame_id.clone(),
            odom,
        }
    }
}

/// Joint-state style wheel telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WheelStatesMessage {
    pub name: [String; 4],
    #[serde(flatten)]
    pub states: WheelStates,
}

impl From<WheelStates> for WheelStatesMessage {
    fn from(states: WheelStates) -> Self {
        Self {
            name: WHEEL_NAMES.map(str::to_string),
            states,
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
}
