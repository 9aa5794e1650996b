// Wheel actuation for the four-wheel differential drive base
//
// Provides:
// - Differential drive kinematics (body velocity <-> encoder speeds)
// - The wheel actuator contract with simulated and Feetech servo backends

mod actuator;
pub mod feetech;
pub mod kinematics;

pub use actuator::{SimWheel, WheelActuator};
pub use feetech::{FeetechBus, FeetechError, FeetechWheel};
pub use kinematics::{body_to_wheel_ticks, wheel_ticks_to_body, WheelSetpoints};
