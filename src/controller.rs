// Differential drive controller: 100 Hz control thread plus command watchdog
//
// Shared state lives behind two independent locks, one for the pose estimate
// and one for the wheels and their telemetry. No code path holds both.
// The last command time is a relaxed atomic re-checked by the watchdog.
// Both loops run on dedicated threads so actuator I/O never stalls the
// async runtime that publishes telemetry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{CONTROL_DT, CONTROL_PERIOD, CONTROL_PERIOD_MS};
use crate::motor::kinematics::{
    body_to_wheel_ticks, effort_from_power, ticks_to_rad, wheel_ticks_to_body,
};
use crate::motor::WheelActuator;
use crate::odometry::{Odometry, WheelStates};
use crate::params::DriveParams;

/// The four wheel actuators in order [FL, RL, FR, RR]
pub type Wheels = [Box<dyn WheelActuator>; 4];

struct WheelBank {
    actuators: Wheels,
    states: WheelStates,
}

struct Shared {
    params: DriveParams,
    odom: RwLock<Odometry>,
    wheels: Mutex<WheelBank>,
    epoch: Instant,
    last_command_ms: AtomicU64, // ms since `epoch`
}

impl Shared {
    fn set_speed(&self, linear: f32, angular: f32) {
        let setpoints = body_to_wheel_ticks(linear, angular, &self.params);
        {
            let mut bank = self.wheels.lock();
            for (wheel, target) in bank.actuators.iter_mut().zip(setpoints.as_array()) {
                wheel.set_speed(target);
            }
        }

        if self.params.input_timeout.is_some() {
            self.touch();
        }
    }

    fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_command_ms.store(elapsed, Ordering::Relaxed);
    }

    fn last_command(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_command_ms.load(Ordering::Relaxed))
    }

    /// One control period: drive the actuators, integrate odometry,
    /// refresh the wheel telemetry
    fn control_tick(&self) {
        let speeds: [f32; 4] = {
            let mut bank = self.wheels.lock();
            for wheel in bank.actuators.iter_mut() {
                wheel.update(CONTROL_PERIOD_MS);
            }
            bank.actuators.each_ref().map(|wheel| wheel.speed())
        };

        let left = (speeds[0] + speeds[1]) / 2.0;
        let right = (speeds[2] + speeds[3]) / 2.0;
        let (vel_lin, vel_ang) = wheel_ticks_to_body(left, right, &self.params);

        self.odom.write().integrate(vel_lin, vel_ang, CONTROL_DT);

        self.refresh_wheel_states();
    }

    fn refresh_wheel_states(&self) {
        let resolution = self.params.encoder_resolution;
        let mut bank = self.wheels.lock();

        let mut states = WheelStates::default();
        for (i, wheel) in bank.actuators.iter().enumerate() {
            states.position[i] = ticks_to_rad(wheel.distance(), resolution);
            states.velocity[i] = ticks_to_rad(wheel.speed(), resolution);
            states.effort[i] = effort_from_power(wheel.power());
        }
        bank.states = states;
    }
}

/// Block until `deadline`; false once the controller is shutting down
///
/// Nothing is ever sent on the shutdown channel, dropping the sender is
/// the stop signal.
fn wait_until(shutdown: &Receiver<()>, deadline: Instant) -> bool {
    matches!(shutdown.recv_deadline(deadline), Err(RecvTimeoutError::Timeout))
}

/// Fixed-period loop; wake times are anchored to the first tick, so a slow
/// tick shortens the following wait instead of shifting the schedule
fn control_loop(shared: Arc<Shared>, shutdown: Receiver<()>) {
    let mut next_tick = Instant::now();
    loop {
        shared.control_tick();
        next_tick += CONTROL_PERIOD;
        if !wait_until(&shutdown, next_tick) {
            break;
        }
    }
    debug!("Control loop stopped");
}

/// Zero the command once nothing arrived for `timeout`
fn watchdog_loop(shared: Arc<Shared>, timeout: Duration, shutdown: Receiver<()>) {
    loop {
        let deadline = shared.last_command() + timeout;
        if Instant::now() < deadline {
            if !wait_until(&shutdown, deadline + Duration::from_millis(1)) {
                break;
            }
            continue;
        }

        debug!("No command for {:?}, stopping", timeout);
        // Re-arms the watchdog through the command timestamp
        shared.set_speed(0.0, 0.0);
    }
    debug!("Watchdog stopped");
}

/// Motion controller for a four-wheel differential drive base
///
/// One instance per base. It owns the actuators for its whole life;
/// [`start`](Self::start) spawns the control and watchdog threads and
/// dropping the controller stops and joins them.
pub struct DiffDriveController {
    shared: Arc<Shared>,
    shutdown: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl DiffDriveController {
    /// Create an idle controller (no threads running yet)
    pub fn new(params: DriveParams, wheels: Wheels) -> Self {
        let shared = Shared {
            params,
            odom: RwLock::new(Odometry::default()),
            wheels: Mutex::new(WheelBank {
                actuators: wheels,
                states: WheelStates::default(),
            }),
            epoch: Instant::now(),
            last_command_ms: AtomicU64::new(0),
        };
        Self {
            shared: Arc::new(shared),
            shutdown: None,
            threads: Vec::new(),
        }
    }

    /// Spawn the control thread and, if a timeout is configured, the watchdog
    pub fn start(&mut self) -> std::io::Result<()> {
        if self.shutdown.is_some() {
            warn!("Controller already started");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
        self.shutdown = Some(shutdown_tx);

        let shared = Arc::clone(&self.shared);
        let rx = shutdown_rx.clone();
        self.threads.push(
            thread::Builder::new()
                .name("drive-control".into())
                .spawn(move || control_loop(shared, rx))?,
        );

        match self.shared.params.input_timeout {
            Some(timeout) => {
                self.shared.touch();
                let shared = Arc::clone(&self.shared);
                self.threads.push(
                    thread::Builder::new()
                        .name("drive-watchdog".into())
                        .spawn(move || watchdog_loop(shared, timeout, shutdown_rx))?,
                );
                info!(
                    "Controller started: {}ms period, {}ms input timeout",
                    CONTROL_PERIOD_MS,
                    timeout.as_millis()
                );
            }
            None => info!(
                "Controller started: {}ms period, input watchdog disabled",
                CONTROL_PERIOD_MS
            ),
        }
        Ok(())
    }

    #[cfg(test)]
    fn is_running(&self) -> bool {
        self.threads.iter().any(|handle| !handle.is_finished())
    }

    /// Command body velocity: `linear` in m/s, `angular` in rad/s
    ///
    /// Inputs are not range-checked; the actuators apply their own limits.
    pub fn set_speed(&self, linear: f32, angular: f32) {
        self.shared.set_speed(linear, angular);
    }

    /// Snapshot of the pose/velocity estimate from the last completed tick
    pub fn odom(&self) -> Odometry {
        *self.shared.odom.read()
    }

    /// Reset the pose to the origin; velocities and wheel telemetry are kept
    pub fn reset_odom(&self) {
        self.shared.odom.write().reset_pose();
        info!("Odometry reset");
    }

    /// Snapshot of the wheel telemetry from the last completed refresh
    pub fn wheel_states(&self) -> WheelStates {
        self.shared.wheels.lock().states
    }
}

impl Drop for DiffDriveController {
    fn drop(&mut self) {
        // Disconnecting the channel wakes both loops
        self.shutdown.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("Controller thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::SimWheel;
    use std::f32::consts::PI;

    /// What the test can observe about one wheel
    #[derive(Debug, Default)]
    struct Recorder {
        target: f32,
        updates: u32,
        power: f32,
    }

    /// Ideal wheel that reports into a shared recorder; `update` can be
    /// made to cost wall time like a servo bus round trip
    struct RecordingWheel {
        recorder: Arc<Mutex<Recorder>>,
        speed: f32,
        distance: f32,
        update_cost: Duration,
    }

    impl WheelActuator for RecordingWheel {
        fn set_speed(&mut self, ticks_per_sec: f32) {
            self.recorder.lock().target = ticks_per_sec;
        }

        fn speed(&self) -> f32 {
            self.speed
        }

        fn distance(&self) -> f32 {
            self.distance
        }

        fn power(&self) -> f32 {
            self.recorder.lock().power
        }

        fn update(&mut self, dt_ms: u32) {
            if !self.update_cost.is_zero() {
                thread::sleep(self.update_cost);
            }
            let mut recorder = self.recorder.lock();
            recorder.updates += 1;
            self.speed = recorder.target;
            self.distance += self.speed * dt_ms as f32 / 1000.0;
        }
    }

    fn leo_params(input_timeout: Option<Duration>) -> DriveParams {
        DriveParams {
            wheel_radius: 0.0625,
            wheel_separation: 0.33,
            angular_velocity_multiplier: 1.91,
            encoder_resolution: 878.4,
            input_timeout,
        }
    }

    fn recorded_controller(
        params: DriveParams,
        update_cost: Duration,
    ) -> (DiffDriveController, [Arc<Mutex<Recorder>>; 4]) {
        let recorders: [Arc<Mutex<Recorder>>; 4] = Default::default();
        let wheels: Wheels = recorders.each_ref().map(|recorder| {
            Box::new(RecordingWheel {
                recorder: Arc::clone(recorder),
                speed: 0.0,
                distance: 0.0,
                update_cost,
            }) as Box<dyn WheelActuator>
        });
        (DiffDriveController::new(params, wheels), recorders)
    }

    fn sim_controller(params: DriveParams) -> DiffDriveController {
        let wheels: Wheels = std::array::from_fn(|_| {
            Box::new(SimWheel::ideal()) as Box<dyn WheelActuator>
        });
        DiffDriveController::new(params, wheels)
    }

    fn tick_n(controller: &DiffDriveController, n: usize) {
        for _ in 0..n {
            controller.shared.control_tick();
        }
    }

    #[test]
    fn test_set_speed_duplicates_per_side() {
        let (controller, recorders) = recorded_controller(leo_params(None), Duration::ZERO);
        controller.set_speed(0.3, 0.8);

        let targets = recorders.each_ref().map(|r| r.lock().target);
        assert_eq!(targets[0], targets[1]);
        assert_eq!(targets[2], targets[3]);
        assert!(targets[2] > targets[0]);
    }

    #[test]
    fn test_side_difference_matches_angular_term() {
        let params = leo_params(None);
        let (controller, recorders) = recorded_controller(params, Duration::ZERO);

        for &(linear, angular) in &[(0.0, 0.5), (0.7, 0.5), (-0.2, -1.2)] {
            controller.set_speed(linear, angular);
            let left = recorders[0].lock().target;
            let right = recorders[2].lock().target;
            let expected = params.encoder_resolution
                * angular
                * params.angular_velocity_multiplier
                * params.wheel_separation
                / (2.0 * PI * params.wheel_radius);
            assert!((right - left - expected).abs() <= expected.abs() * 1e-4);
        }
    }

    #[test]
    fn test_one_second_straight() {
        let controller = sim_controller(leo_params(None));
        controller.set_speed(0.5, 0.0);
        tick_n(&controller, 100);

        let odom = controller.odom();
        assert!(odom.pose_yaw.abs() < 1e-6);
        assert!((odom.pose_x - 0.5).abs() < 1e-3, "x = {}", odom.pose_x);
        assert!(odom.pose_y.abs() < 1e-6);
        assert!((odom.vel_lin - 0.5).abs() < 1e-4);
        assert!(odom.vel_ang.abs() < 1e-6);
    }

    #[test]
    fn test_measured_angular_matches_command() {
        let controller = sim_controller(leo_params(None));
        controller.set_speed(0.0, 0.4);
        tick_n(&controller, 1);

        let odom = controller.odom();
        assert!((odom.vel_ang - 0.4).abs() < 1e-4);
        assert!(odom.vel_lin.abs() < 1e-5);
        assert!((odom.pose_yaw - 0.004).abs() < 1e-5);
    }

    #[test]
    fn test_reset_odom_keeps_velocity() {
        let controller = sim_controller(leo_params(None));
        controller.set_speed(0.4, 0.3);
        tick_n(&controller, 50);
        let before = controller.odom();
        let wheels_before = controller.wheel_states();

        controller.reset_odom();

        let after = controller.odom();
        assert_eq!(after.pose_x, 0.0);
        assert_eq!(after.pose_y, 0.0);
        assert_eq!(after.pose_yaw, 0.0);
        assert_eq!(after.vel_lin, before.vel_lin);
        assert_eq!(after.vel_ang, before.vel_ang);
        assert_eq!(controller.wheel_states(), wheels_before);
    }

    #[test]
    fn test_wheel_states() {
        let params = leo_params(None);
        let (controller, recorders) = recorded_controller(params, Duration::ZERO);
        recorders[0].lock().power = 0.0;
        recorders[1].lock().power = 250.0;
        recorders[2].lock().power = -40.0;
        recorders[3].lock().power = 0.0;

        controller.set_speed(0.5, 0.0);
        tick_n(&controller, 100);

        let states = controller.wheel_states();
        assert_eq!(states.effort[0], 0.0);
        assert!((states.effort[1] + 25.0).abs() < 1e-4);
        assert!((states.effort[2] - 4.0).abs() < 1e-5);
        assert_eq!(states.effort[3], 0.0);

        // 0.5 m/s on a 0.0625 m wheel: 8 rad/s, 8 rad after one second
        for i in 0..4 {
            assert!((states.velocity[i] - 8.0).abs() < 1e-3);
            assert!((states.position[i] - 8.0).abs() < 1e-2);
        }
    }

    #[test]
    fn test_control_loop_holds_period_with_slow_actuators() {
        // Each tick spends ~6ms of wall time in the actuators; a plain
        // sleep(period) after every tick would only reach ~62 Hz
        let (mut controller, recorders) =
            recorded_controller(leo_params(None), Duration::from_micros(1500));
        controller.set_speed(0.5, 0.0);
        controller.start().unwrap();
        assert!(controller.is_running());

        thread::sleep(Duration::from_millis(1000));
        let updates = recorders[0].lock().updates;
        let odom = controller.odom();
        drop(controller);

        assert!((96..=104).contains(&updates), "updates = {}", updates);
        // Fixed-step integration only holds if the loop really runs at 100 Hz
        assert!((odom.pose_x - 0.5).abs() < 0.025, "x = {}", odom.pose_x);
    }

    #[test]
    fn test_set_speed_not_blocked_by_slow_loop() {
        let (mut controller, _recorders) =
            recorded_controller(leo_params(None), Duration::from_millis(2));
        controller.start().unwrap();
        thread::sleep(Duration::from_millis(50));

        // Worst case waits out one tick (4 wheels x 2ms) for the wheel lock
        let started = Instant::now();
        for _ in 0..10 {
            controller.set_speed(0.2, 0.1);
            controller.odom();
        }
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn test_drop_stops_threads() {
        let (mut controller, recorders) = recorded_controller(leo_params(None), Duration::ZERO);
        controller.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        drop(controller);

        let updates = recorders[0].lock().updates;
        thread::sleep(Duration::from_millis(50));
        assert_eq!(recorders[0].lock().updates, updates);
    }

    #[test]
    fn test_watchdog_stops_robot() {
        let mut controller = sim_controller(leo_params(Some(Duration::from_millis(150))));
        controller.start().unwrap();
        controller.set_speed(0.5, 0.2);

        thread::sleep(Duration::from_millis(50));
        let moving = controller.odom();
        assert!((moving.vel_lin - 0.5).abs() < 1e-4);

        thread::sleep(Duration::from_millis(250));
        let stopped = controller.odom();
        assert_eq!(stopped.vel_lin, 0.0);
        assert_eq!(stopped.vel_ang, 0.0);
    }

    #[test]
    fn test_commands_keep_watchdog_armed() {
        let mut controller = sim_controller(leo_params(Some(Duration::from_millis(200))));
        controller.start().unwrap();

        for _ in 0..8 {
            controller.set_speed(0.5, 0.0);
            thread::sleep(Duration::from_millis(60));
            assert!((controller.odom().vel_lin - 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn test_disabled_watchdog_never_stops() {
        let mut controller = sim_controller(leo_params(None));
        controller.start().unwrap();
        controller.set_speed(0.5, 0.0);

        thread::sleep(Duration::from_millis(600));
        assert!((controller.odom().vel_lin - 0.5).abs() < 1e-4);
    }
}
