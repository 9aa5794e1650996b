// Dead-reckoning pose estimate and per-wheel telemetry snapshots

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

const TWO_PI: f32 = 2.0 * PI;

/// Pose (world frame) and velocity (body frame) of the base
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Odometry {
    pub pose_x: f32,   // m
    pub pose_y: f32,   // m
    pub pose_yaw: f32, // rad, in [0, 2π)
    pub vel_lin: f32,  // m/s
    pub vel_ang: f32,  // rad/s
}

impl Odometry {
    /// Store the measured body velocities and advance the pose by `dt` seconds
    ///
    /// Rectangle rule with the heading updated first: x/y are integrated
    /// along the new yaw. Yaw is wrapped with a single add/subtract, which
    /// assumes `|vel_ang * dt| < 2π`.
    pub fn integrate(&mut self, vel_lin: f32, vel_ang: f32, dt: f32) {
        self.vel_lin = vel_lin;
        self.vel_ang = vel_ang;

        self.pose_yaw += vel_ang * dt;
        if self.pose_yaw >= TWO_PI {
            self.pose_yaw -= TWO_PI;
        } else if self.pose_yaw < 0.0 {
            self.pose_yaw += TWO_PI;
            // -ε + 2π can round up to exactly 2π in f32
            if self.pose_yaw >= TWO_PI {
                self.pose_yaw = 0.0;
            }
        }

        self.pose_x += vel_lin * self.pose_yaw.cos() * dt;
        self.pose_y += vel_lin * self.pose_yaw.sin() * dt;
    }

    /// Move back to the origin; velocities are left as measured
    pub fn reset_pose(&mut self) {
        self.pose_x = 0.0;
        self.pose_y = 0.0;
        self.pose_yaw = 0.0;
    }
}

/// Wheel telemetry in fixed order [FL, RL, FR, RR]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WheelStates {
    pub position: [f32; 4], // rad
    pub velocity: [f32; 4], // rad/s
    pub effort: [f32; 4],   // unitless
}
