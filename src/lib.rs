// Motion control and calibration persistence for a four-wheel differential drive base

pub mod config;
pub mod controller;
pub mod messages;
pub mod motor;
pub mod odometry;
pub mod params;
pub mod runtime;
pub mod store;
pub mod teleop;

pub use controller::{DiffDriveController, Wheels};
pub use odometry::{Odometry, WheelStates};
pub use params::{DriveParams, Parameters};
pub use store::{ConfigRecord, ConfigStore, LoadOutcome};
