// Calibration record and its checksummed byte layout
//
// Layout (little endian, 52 bytes):
//   [0]      checksum = sum of bytes 1..52 (mod 256)
//   [1..4]   debug_logging, imu_enabled, gps_enabled
//   [4..16]  gyro_bias  (3 x f32)
//   [16..28] accel_bias (3 x f32)
//   [28..40] mag_scale  (3 x f32)
//   [40..52] mag_bias   (3 x f32)

use serde::{Deserialize, Serialize};

pub const RECORD_SIZE: usize = 52;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error("Record is {got} bytes, expected {expected}")]
    Length { expected: usize, got: usize },

    #[error("Checksum mismatch: stored {stored}, computed {computed}")]
    Checksum { stored: u8, computed: u8 },
}

/// Persistent calibration data
///
/// The checksum is not a field: it is produced by [`encode`](Self::encode)
/// and verified by [`decode`](Self::decode).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub debug_logging: bool,
    pub imu_enabled: bool,
    pub gps_enabled: bool,
    pub gyro_bias: [f32; 3],
    pub accel_bias: [f32; 3],
    pub mag_scale: [f32; 3],
    pub mag_bias: [f32; 3],
}

impl Default for ConfigRecord {
    fn default() -> Self {
        Self {
            debug_logging: false,
            imu_enabled: false,
            gps_enabled: false,
            gyro_bias: [0.0; 3],
            accel_bias: [0.0; 3],
            mag_scale: [1.0; 3],
            mag_bias: [0.0; 3],
        }
    }
}

/// Byte sum of everything after the checksum byte
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .skip(1)
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn put_vec3(out: &mut [u8], v: &[f32; 3]) {
    for (chunk, value) in out.chunks_exact_mut(4).zip(v) {
        chunk.copy_from_slice(&value.to_le_bytes());
    }
}

fn get_vec3(bytes: &[u8]) -> [f32; 3] {
    let mut v = [0.0f32; 3];
    for (value, chunk) in v.iter_mut().zip(bytes.chunks_exact(4)) {
        *value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    v
}

impl ConfigRecord {
    /// Serialize with a valid checksum in byte 0
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[1] = self.debug_logging as u8;
        bytes[2] = self.imu_enabled as u8;
        bytes[3] = self.gps_enabled as u8;
        put_vec3(&mut bytes[4..16], &self.gyro_bias);
        put_vec3(&mut bytes[16..28], &self.accel_bias);
        put_vec3(&mut bytes[28..40], &self.mag_scale);
        put_vec3(&mut bytes[40..52], &self.mag_bias);
        bytes[0] = checksum(&bytes);
        bytes
    }

    /// Parse a serialized record, rejecting it unless the checksum matches
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() != RECORD_SIZE {
            return Err(RecordError::Length {
                expected: RECORD_SIZE,
                got: bytes.len(),
            });
        }

        let computed = checksum(bytes);
        if computed != bytes[0] {
            return Err(RecordError::Checksum {
                stored: bytes[0],
                computed,
            });
        }

        Ok(Self {
            debug_logging: bytes[1] != 0,
            imu_enabled: bytes[2] != 0,
            gps_enabled: bytes[3] != 0,
            gyro_bias: get_vec3(&bytes[4..16]),
            accel_bias: get_vec3(&bytes[16..28]),
            mag_scale: get_vec3(&bytes[28..40]),
            mag_bias: get_vec3(&bytes[40..52]),
        })
    }

    pub fn checksum(&self) -> u8 {
        self.encode()[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConfigRecord {
        ConfigRecord {
            debug_logging: true,
            imu_enabled: true,
            gps_enabled: false,
            gyro_bias: [0.01, -0.02, 0.003],
            accel_bias: [0.1, 0.2, -9.5],
            mag_scale: [1.1, 0.9, 1.05],
            mag_bias: [12.5, -3.25, 40.0],
        }
    }

    #[test]
    fn test_layout() {
        let bytes = sample().encode();
        assert_eq!(bytes.len(), RECORD_SIZE);
        assert_eq!(&bytes[1..4], &[1, 1, 0]);
        assert_eq!(&bytes[4..8], &0.01f32.to_le_bytes());
        assert_eq!(&bytes[48..52], &40.0f32.to_le_bytes());
    }

    #[test]
    fn test_checksum_skips_first_byte() {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0] = 0xAA;
        bytes[1] = 200;
        bytes[2] = 100;
        // 300 mod 256
        assert_eq!(checksum(&bytes), 44);
    }

    #[test]
    fn test_decode_valid() {
        let record = sample();
        assert_eq!(ConfigRecord::decode(&record.encode()), Ok(record));
    }

    #[test]
    fn test_single_bit_flip_is_rejected() {
        let mut bytes = sample().encode();
        bytes[20] ^= 0x01;
        assert!(matches!(
            ConfigRecord::decode(&bytes),
            Err(RecordError::Checksum { .. })
        ));
    }

    #[test]
    fn test_erased_medium_is_rejected() {
        assert!(ConfigRecord::decode(&[0xFF; RECORD_SIZE]).is_err());
    }

    #[test]
    fn test_wrong_length_is_rejected() {
        assert_eq!(
            ConfigRecord::decode(&[0u8; 10]),
            Err(RecordError::Length {
                expected: RECORD_SIZE,
                got: 10
            })
        );
    }
}
