// Differential drive kinematics for the four-wheel skid base
// Converts body-frame velocities (linear, angular) to per-side encoder
// speeds, and measured encoder speeds back to body velocities.

use std::f32::consts::PI;

use crate::config::EFFORT_GAIN;
use crate::params::DriveParams;

/// Encoder speed targets (ticks/s) for each side of the base
///
/// Front and rear wheels on one side always share a target.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WheelSetpoints {
    pub left: f32,
    pub right: f32,
}

impl WheelSetpoints {
    /// Returns targets as array [FL, RL, FR, RR]
    pub fn as_array(&self) -> [f32; 4] {
        [self.left, self.left, self.right, self.right]
    }
}

/// Convert wheel angular velocity (rad/s) to encoder speed (ticks/s)
pub fn radps_to_ticks(radps: f32, encoder_resolution: f32) -> f32 {
    encoder_resolution * radps / (2.0 * PI)
}

/// Convert an encoder quantity (ticks or ticks/s) to radians (or rad/s)
pub fn ticks_to_rad(ticks: f32, encoder_resolution: f32) -> f32 {
    2.0 * PI * ticks / encoder_resolution
}

/// Convert body-frame velocities to encoder speed targets
///
/// # Arguments
/// * `linear` - Forward velocity in m/s (positive = forward)
/// * `angular` - Yaw rate in rad/s (positive = counter-clockwise)
///
/// No limits are applied here; clamping is the actuator's business.
pub fn body_to_wheel_ticks(linear: f32, angular: f32, params: &DriveParams) -> WheelSetpoints {
    let angular = angular * params.angular_velocity_multiplier;

    // Wheel surface speeds (m/s)
    let left_lin = linear - angular * params.wheel_separation / 2.0;
    let right_lin = linear + angular * params.wheel_separation / 2.0;

    // Wheel angular speeds (rad/s)
    let left_ang = left_lin / params.wheel_radius;
    let right_ang = right_lin / params.wheel_radius;

    WheelSetpoints {
        left: radps_to_ticks(left_ang, params.encoder_resolution),
        right: radps_to_ticks(right_ang, params.encoder_resolution),
    }
}

/// Convert measured side speeds (ticks/s) to body velocities
///
/// Returns `(linear m/s, angular rad/s)`. The angular rate is divided by the
/// correction multiplier so it lives in the same frame as the commanded one.
pub fn wheel_ticks_to_body(left: f32, right: f32, params: &DriveParams) -> (f32, f32) {
    let left_lin = ticks_to_rad(left, params.encoder_resolution) * params.wheel_radius;
    let right_lin = ticks_to_rad(right, params.encoder_resolution) * params.wheel_radius;

    let linear = (left_lin + right_lin) / 2.0;
    let angular = (right_lin - left_lin) / params.wheel_separation;

    (linear, angular / params.angular_velocity_multiplier)
}

/// Unitless effort proxy from actuator applied power
pub fn effort_from_power(power: f32) -> f32 {
    if power == 0.0 {
        0.0
    } else {
        power * EFFORT_GAIN
    }
}
