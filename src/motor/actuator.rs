// Wheel actuator contract and a simulated implementation
//
// An actuator owns its own velocity loop. The controller only sets a target
// in encoder ticks/s, calls `update` once per control period and reads back
// speed, cumulative distance and applied power.

/// Per-wheel velocity actuator
pub trait WheelActuator: Send {
    /// Set the velocity target in encoder ticks per second
    fn set_speed(&mut self, ticks_per_sec: f32);

    /// Measured speed in ticks per second
    fn speed(&self) -> f32;

    /// Cumulative travelled distance in ticks
    fn distance(&self) -> f32;

    /// Applied power (unitless, actuator specific scale)
    fn power(&self) -> f32;

    /// Run one step of the actuator's internal loop
    fn update(&mut self, dt_ms: u32);
}

/// Simulated wheel with a first-order velocity response
///
/// A time constant of zero makes the wheel reach its target on the next
/// update. Power is reported proportional to speed, scaled so that
/// `max_speed` maps to `power_limit`.
#[derive(Debug, Clone)]
pub struct SimWheel {
    target: f32,
    speed: f32,
    distance: f32,
    max_speed: f32,
    power_limit: f32,
    time_constant_ms: f32,
}

impl SimWheel {
    pub fn new(max_speed: f32, power_limit: f32) -> Self {
        Self {
            target: 0.0,
            speed: 0.0,
            distance: 0.0,
            max_speed,
            power_limit,
            time_constant_ms: 0.0,
        }
    }

    /// Wheel that settles instantly and never saturates
    pub fn ideal() -> Self {
        Self::new(f32::INFINITY, 1000.0)
    }

    pub fn with_time_constant(mut self, time_constant_ms: f32) -> Self {
        self.time_constant_ms = time_constant_ms.max(0.0);
        self
    }
}

impl WheelActuator for SimWheel {
    fn set_speed(&mut self, ticks_per_sec: f32) {
        self.target = ticks_per_sec.clamp(-self.max_speed, self.max_speed);
    }

    fn speed(&self) -> f32 {
        self.speed
    }

    fn distance(&self) -> f32 {
        self.distance
    }

    fn power(&self) -> f32 {
        if self.max_speed.is_finite() && self.max_speed > 0.0 {
            self.speed / self.max_speed * self.power_limit
        } else {
            self.speed
        }
    }

    fn update(&mut self, dt_ms: u32) {
        let dt_ms = dt_ms as f32;
        if self.time_constant_ms <= 0.0 {
            self.speed = self.target;
        } else {
            let alpha = (dt_ms / (self.time_constant_ms + dt_ms)).min(1.0);
            self.speed += (self.target - self.speed) * alpha;
        }
        self.distance += self.speed * dt_ms / 1000.0;
    }
}
