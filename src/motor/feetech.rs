// Feetech STS serial servos used as wheel actuators
//
// Packet format: [0xFF, 0xFF, ID, Length, Instruction, Params..., Checksum]
// The servos run in velocity mode and close their own speed loop. A single
// bus thread owns the serial port; a `FeetechWheel` only trades its target
// for the latest telemetry sample on `update`.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicI16, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serialport::SerialPort;
use tracing::{debug, error, info, warn};

use super::actuator::WheelActuator;
use crate::config::CONTROL_PERIOD;

pub const DEFAULT_BAUDRATE: u32 = 1_000_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 20;

/// Position counts per revolution (12-bit absolute encoder)
pub const STEPS_PER_REVOLUTION: u16 = 4096;

const HEADER: [u8; 2] = [0xFF, 0xFF];
const BROADCAST_ID: u8 = 0xFE;

#[repr(u8)]
#[derive(Debug, Clone, Copy)]
enum Instruction {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
}

/// Control table addresses used by the wheel backend
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Register {
    OperatingMode = 33,   // 1 byte: 0=position, 1=velocity
    TorqueEnable = 40,    // 1 byte
    GoalVelocity = 46,    // 2 bytes, sign-magnitude (bit 15)
    Lock = 55,            // 1 byte
    PresentPosition = 56, // 2 bytes, 0..4095
    PresentVelocity = 58, // 2 bytes, sign-magnitude (bit 15)
    PresentLoad = 60,     // 2 bytes, sign-magnitude (bit 10), 0.1% units
}

const MODE_VELOCITY: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum FeetechError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from servo {id}: {reason}")]
    InvalidResponse { id: u8, reason: String },

    #[error("Checksum mismatch for servo {id}")]
    ChecksumMismatch { id: u8 },

    #[error("Servo {id} returned error status: 0x{status:02X}")]
    ServoError { id: u8, status: u8 },

    #[error("Timeout waiting for response from servo {id}")]
    Timeout { id: u8 },
}

pub type Result<T> = std::result::Result<T, FeetechError>;

/// Inverted sum of every byte after the header
fn checksum(data: &[u8]) -> u8 {
    !data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn encode_packet(id: u8, instruction: Instruction, params: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(6 + params.len());
    packet.extend_from_slice(&HEADER);
    packet.push(id);
    packet.push((params.len() + 2) as u8);
    packet.push(instruction as u8);
    packet.extend_from_slice(params);
    packet.push(checksum(&packet[2..]));
    packet
}

/// Sign-magnitude with the sign at `sign_bit`
fn encode_signed(value: i16, sign_bit: u8) -> u16 {
    let magnitude = value.unsigned_abs() & ((1 << sign_bit) - 1);
    if value < 0 {
        magnitude | (1 << sign_bit)
    } else {
        magnitude
    }
}

fn decode_signed(raw: u16, sign_bit: u8) -> i16 {
    let magnitude = (raw & ((1 << sign_bit) - 1)) as i16;
    if raw & (1 << sign_bit) != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Signed step delta between two absolute positions, handling wraparound
fn position_delta(current: u16, previous: u16) -> i32 {
    let half = (STEPS_PER_REVOLUTION / 2) as i32;
    let mut delta = current as i32 - previous as i32;
    if delta > half {
        delta -= STEPS_PER_REVOLUTION as i32;
    } else if delta < -half {
        delta += STEPS_PER_REVOLUTION as i32;
    }
    delta
}

/// Half-duplex serial bus shared by all servos
pub struct FeetechBus {
    port: Box<dyn SerialPort>,
}

impl FeetechBus {
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        info!("Opening servo bus on {} @ {}", port_name, baudrate);
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;
        Ok(Self { port })
    }

    /// Send one instruction and, unless broadcast, return the status params
    fn transact(&mut self, id: u8, instruction: Instruction, params: &[u8]) -> Result<Vec<u8>> {
        let packet = encode_packet(id, instruction, params);
        self.port.write_all(&packet)?;
        self.port.flush()?;
        if id == BROADCAST_ID {
            return Ok(Vec::new());
        }
        self.read_status(id)
    }

    fn read_status(&mut self, expected_id: u8) -> Result<Vec<u8>> {
        let mut head = [0u8; 4]; // header, id, length
        self.port.read_exact(&mut head).map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                FeetechError::Timeout { id: expected_id }
            } else {
                FeetechError::Io(e)
            }
        })?;

        if head[..2] != HEADER {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("Invalid header: {:02X?}", &head[..2]),
            });
        }
        let (id, length) = (head[2], head[3] as usize);
        if id != expected_id {
            return Err(FeetechError::InvalidResponse {
                id: expected_id,
                reason: format!("ID mismatch: got {}", id),
            });
        }
        if length < 2 {
            return Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Length {} too short", length),
            });
        }

        // error status + params + checksum
        let mut body = vec![0u8; length];
        self.port.read_exact(&mut body)?;

        let (payload, received) = body.split_at(length - 1);
        let mut summed = vec![id, length as u8];
        summed.extend_from_slice(payload);
        if checksum(&summed) != received[0] {
            return Err(FeetechError::ChecksumMismatch { id });
        }
        if payload[0] != 0 {
            return Err(FeetechError::ServoError {
                id,
                status: payload[0],
            });
        }
        Ok(payload[1..].to_vec())
    }

    pub fn ping(&mut self, id: u8) -> Result<bool> {
        match self.transact(id, Instruction::Ping, &[]) {
            Ok(_) => Ok(true),
            Err(FeetechError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn write_u8(&mut self, id: u8, register: Register, value: u8) -> Result<()> {
        debug!("Write u8 to servo {}: reg={:?}, value={}", id, register, value);
        self.transact(id, Instruction::Write, &[register as u8, value])
            .map(|_| ())
    }

    pub fn write_u16(&mut self, id: u8, register: Register, value: u16) -> Result<()> {
        let [lo, hi] = value.to_le_bytes();
        self.transact(id, Instruction::Write, &[register as u8, lo, hi])
            .map(|_| ())
    }

    pub fn read_u16(&mut self, id: u8, register: Register) -> Result<u16> {
        let data = self.transact(id, Instruction::Read, &[register as u8, 2])?;
        match data.as_slice() {
            [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
            _ => Err(FeetechError::InvalidResponse {
                id,
                reason: format!("Expected 2 bytes, got {}", data.len()),
            }),
        }
    }

    /// Switch a servo to velocity mode with torque enabled
    pub fn enable_velocity_mode(&mut self, id: u8) -> Result<()> {
        self.write_u8(id, Register::TorqueEnable, 0)?;
        self.write_u8(id, Register::Lock, 0)?;
        self.write_u8(id, Register::OperatingMode, MODE_VELOCITY)?;
        self.write_u8(id, Register::TorqueEnable, 1)?;
        self.write_u8(id, Register::Lock, 1)
    }

    pub fn set_velocity(&mut self, id: u8, steps_per_sec: i16) -> Result<()> {
        self.write_u16(id, Register::GoalVelocity, encode_signed(steps_per_sec, 15))
    }

    pub fn present_velocity(&mut self, id: u8) -> Result<i16> {
        Ok(decode_signed(self.read_u16(id, Register::PresentVelocity)?, 15))
    }

    pub fn present_position(&mut self, id: u8) -> Result<u16> {
        Ok(self.read_u16(id, Register::PresentPosition)? % STEPS_PER_REVOLUTION)
    }

    pub fn present_load(&mut self, id: u8) -> Result<i16> {
        Ok(decode_signed(self.read_u16(id, Register::PresentLoad)?, 10))
    }
}

/// Sample taken from a servo by the bus thread
#[derive(Debug, Clone, Copy)]
struct ServoSample {
    position: u16,
    velocity: i16,
    load: i16,
}

/// Mailbox between one wheel and the bus thread
#[derive(Debug, Default)]
struct ServoSlot {
    goal: AtomicI16, // steps/s, direction already applied
    sample: Mutex<Option<ServoSample>>,
}

/// Handle on the bus thread; dropping the last wheel stops it
struct BusWorker {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for BusWorker {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Servo bus thread panicked");
            }
        }
    }
}

fn exchange(bus: &mut FeetechBus, id: u8, goal: i16) -> Result<ServoSample> {
    bus.set_velocity(id, goal)?;
    Ok(ServoSample {
        position: bus.present_position(id)?,
        velocity: bus.present_velocity(id)?,
        load: bus.present_load(id)?,
    })
}

/// Round-robin over the servos once per control period: write each goal,
/// read back telemetry. Servos are stopped when the loop exits.
fn bus_loop(mut bus: FeetechBus, servos: Vec<(u8, Arc<ServoSlot>)>, shutdown: Receiver<()>) {
    let mut next_cycle = Instant::now();
    loop {
        for (id, slot) in &servos {
            match exchange(&mut bus, *id, slot.goal.load(Ordering::Relaxed)) {
                Ok(sample) => *slot.sample.lock() = Some(sample),
                Err(e) => warn!("Servo {} update failed: {}", id, e),
            }
        }

        // A slow bus cycle is not made up for; the next one starts right away
        next_cycle = (next_cycle + CONTROL_PERIOD).max(Instant::now());
        match shutdown.recv_deadline(next_cycle) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }

    for (id, _) in &servos {
        if let Err(e) = bus.set_velocity(*id, 0) {
            warn!("Failed to stop servo {}: {}", id, e);
        }
    }
    debug!("Servo bus thread stopped");
}

/// Put every `(id, reversed)` servo in velocity mode, then hand the bus to
/// a dedicated thread and return one wheel per servo
///
/// Serial I/O only ever happens on that thread, so `update` on the
/// returned wheels never blocks.
pub fn spawn_wheels<const N: usize>(
    mut bus: FeetechBus,
    servos: [(u8, bool); N],
) -> Result<[FeetechWheel; N]> {
    for (id, reversed) in servos {
        if !bus.ping(id)? {
            warn!("Servo {} not responding to ping", id);
            return Err(FeetechError::Timeout { id });
        }
        bus.enable_velocity_mode(id)?;
        debug!("Servo {} ready (reversed={})", id, reversed);
    }

    let slots: [Arc<ServoSlot>; N] = std::array::from_fn(|_| Arc::default());
    let assignments: Vec<_> = servos
        .iter()
        .zip(&slots)
        .map(|(&(id, _), slot)| (id, Arc::clone(slot)))
        .collect();

    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(0);
    let thread = thread::Builder::new()
        .name("feetech-bus".into())
        .spawn(move || bus_loop(bus, assignments, shutdown_rx))?;
    let worker = Arc::new(BusWorker {
        shutdown: Some(shutdown_tx),
        thread: Some(thread),
    });
    info!("Servo bus thread started for {} servos", N);

    Ok(std::array::from_fn(|i| {
        FeetechWheel::new(Arc::clone(&slots[i]), servos[i].1, Arc::clone(&worker))
    }))
}

/// One wheel driven by a Feetech servo in velocity mode
///
/// Ticks are servo position steps, so `motor_encoder_resolution` must be
/// set to [`STEPS_PER_REVOLUTION`] for this backend. Mirrored wheels
/// (`reversed`) invert the sign of every command and reading. Readings lag
/// the bus thread by at most one cycle.
pub struct FeetechWheel {
    slot: Arc<ServoSlot>,
    _worker: Arc<BusWorker>,
    reversed: bool,
    target: f32,
    speed: f32,
    distance: f32,
    power: f32,
    last_position: Option<u16>,
}

impl FeetechWheel {
    fn new(slot: Arc<ServoSlot>, reversed: bool, worker: Arc<BusWorker>) -> Self {
        Self {
            slot,
            _worker: worker,
            reversed,
            target: 0.0,
            speed: 0.0,
            distance: 0.0,
            power: 0.0,
            last_position: None,
        }
    }

    fn sign(&self) -> f32 {
        if self.reversed { -1.0 } else { 1.0 }
    }

    fn apply(&mut self, sample: ServoSample) {
        let sign = self.sign();
        if let Some(previous) = self.last_position {
            self.distance += sign * position_delta(sample.position, previous) as f32;
        }
        self.last_position = Some(sample.position);
        self.speed = sign * sample.velocity as f32;
        self.power = sign * sample.load as f32;
    }
}

impl WheelActuator for FeetechWheel {
    fn set_speed(&mut self, ticks_per_sec: f32) {
        self.target = ticks_per_sec;
    }

    fn speed(&self) -> f32 {
        self.speed
    }

    fn distance(&self) -> f32 {
        self.distance
    }

    fn power(&self) -> f32 {
        self.power
    }

    fn update(&mut self, _dt_ms: u32) {
        let goal = (self.sign() * self.target)
            .round()
            .clamp(i16::MIN as f32 + 1.0, i16::MAX as f32) as i16;
        self.slot.goal.store(goal, Ordering::Relaxed);

        let sample = *self.slot.sample.lock();
        if let Some(sample) = sample {
            self.apply(sample);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        // ~(1+4+3+30+0+2) = ~40 = 215
        assert_eq!(checksum(&[1u8, 4, 0x03, 30, 0, 2]), 215);
        // Wraps past 255 before inverting
        assert_eq!(checksum(&[0xFE, 0x04]), !0x02u8);
    }

    #[test]
    fn test_encode_packet() {
        let packet = encode_packet(1, Instruction::Ping, &[]);
        assert_eq!(packet, vec![0xFF, 0xFF, 1, 2, 0x01, !4u8]);

        let packet = encode_packet(7, Instruction::Read, &[Register::PresentLoad as u8, 2]);
        assert_eq!(packet.len(), 8);
        assert_eq!(packet[3], 4);
        assert_eq!(packet[5], 60);
    }

    #[test]
    fn test_velocity_sign_magnitude() {
        assert_eq!(encode_signed(100, 15), 100);
        assert_eq!(encode_signed(-100, 15), 0x8064);
        assert_eq!(decode_signed(0x8064, 15), -100);
        assert_eq!(decode_signed(0, 15), 0);
    }

    #[test]
    fn test_load_sign_bit() {
        // Load direction lives in bit 10
        assert_eq!(decode_signed(0x0400 | 250, 10), -250);
        assert_eq!(decode_signed(250, 10), 250);
        assert_eq!(encode_signed(-250, 10), 0x0400 | 250);
    }

    #[test]
    fn test_position_delta_wraparound() {
        assert_eq!(position_delta(110, 100), 10);
        assert_eq!(position_delta(100, 110), -10);
        // Forward across 4095 -> 0
        assert_eq!(position_delta(5, 4090), 11);
        // Backward across 0 -> 4095
        assert_eq!(position_delta(4090, 5), -11);
    }

    fn detached_wheel(reversed: bool) -> (FeetechWheel, Arc<ServoSlot>) {
        let slot = Arc::new(ServoSlot::default());
        let worker = Arc::new(BusWorker {
            shutdown: None,
            thread: None,
        });
        (FeetechWheel::new(Arc::clone(&slot), reversed, worker), slot)
    }

    #[test]
    fn test_update_posts_goal_to_bus_thread() {
        let (mut wheel, slot) = detached_wheel(true);
        wheel.set_speed(300.4);
        wheel.update(10);
        assert_eq!(slot.goal.load(Ordering::Relaxed), -300);
        // Nothing sampled yet
        assert_eq!(wheel.speed(), 0.0);
        assert_eq!(wheel.distance(), 0.0);
    }

    #[test]
    fn test_samples_drive_telemetry() {
        let (mut wheel, slot) = detached_wheel(true);
        *slot.sample.lock() = Some(ServoSample {
            position: 4090,
            velocity: -200,
            load: 30,
        });
        wheel.update(10);
        assert_eq!(wheel.distance(), 0.0);
        assert_eq!(wheel.speed(), 200.0);
        assert_eq!(wheel.power(), -30.0);

        *slot.sample.lock() = Some(ServoSample {
            position: 5,
            velocity: -200,
            load: 30,
        });
        wheel.update(10);
        assert_eq!(wheel.distance(), -11.0);

        // A sample read twice adds no distance
        wheel.update(10);
        assert_eq!(wheel.distance(), -11.0);
    }
}
