// Configuration store: validated calibration record persisted across power cycles
//
// The in-memory record is the source of truth between stores. Loading retries
// a bounded number of times and re-persists the current (default) record when
// storage never yields a valid one.

mod record;
mod storage;

pub use record::{checksum, ConfigRecord, RecordError, RECORD_SIZE};
pub use storage::{FileStorage, MemoryStorage, Storage, StorageError, ERASED};

use tracing::{error, info, warn};

use crate::config::{CONFIG_ADDRESS, CONFIG_LOAD_ATTEMPTS};

/// Why one load attempt produced no usable record
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("read failed: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid record: {0}")]
    Record(#[from] RecordError),
}

/// Result of [`ConfigStore::load`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A valid record was read on the given attempt (1-based)
    Loaded { attempt: u32 },
    /// No valid record; the active record was written back as the new baseline
    RestoredDefaults,
}

/// Owner of the active configuration record
///
/// Create one per process, call [`load`](Self::load) once at startup and
/// hand it to whatever needs the calibration data.
pub struct ConfigStore<S: Storage> {
    storage: S,
    address: u64,
    record: ConfigRecord,
}

impl<S: Storage> ConfigStore<S> {
    /// Store with compile-time defaults as the active record
    pub fn new(storage: S) -> Self {
        Self::with_address(storage, CONFIG_ADDRESS)
    }

    pub fn with_address(storage: S, address: u64) -> Self {
        Self {
            storage,
            address,
            record: ConfigRecord::default(),
        }
    }

    /// Copy of the active record
    pub fn record(&self) -> ConfigRecord {
        self.record
    }

    #[cfg(test)]
    fn storage(&self) -> &S {
        &self.storage
    }

    #[cfg(test)]
    fn into_storage(self) -> S {
        self.storage
    }

    /// One read of the persisted bytes, decoded and checksum-verified
    fn read_record(&mut self) -> Result<ConfigRecord, LoadError> {
        let mut bytes = [0u8; RECORD_SIZE];
        self.storage.load(self.address, &mut bytes)?;
        Ok(ConfigRecord::decode(&bytes)?)
    }

    /// Read and validate the persisted record
    ///
    /// Never fails: after [`CONFIG_LOAD_ATTEMPTS`] invalid reads the active
    /// record is stored instead.
    pub fn load(&mut self) -> LoadOutcome {
        for attempt in 1..=CONFIG_LOAD_ATTEMPTS {
            match self.read_record() {
                Ok(record) => {
                    self.record = record;
                    info!("Loaded config:");
                    self.print();
                    return LoadOutcome::Loaded { attempt };
                }
                Err(reason) => warn!(
                    "Loaded an invalid config ({}), attempt {}/{}",
                    reason, attempt, CONFIG_LOAD_ATTEMPTS
                ),
            }
        }

        error!(
            "Failed to load valid config after {} tries! Default configuration will be used",
            CONFIG_LOAD_ATTEMPTS
        );
        if let Err(e) = self.store() {
            error!("Failed to store default config: {}", e);
        }
        LoadOutcome::RestoredDefaults
    }

    /// Persist the active record with a freshly computed checksum
    pub fn store(&mut self) -> Result<(), StorageError> {
        self.storage.store(self.address, &self.record.encode())?;
        info!("Stored config:");
        self.print();
        Ok(())
    }

    /// Go back to compile-time defaults and persist them
    pub fn reset(&mut self) -> Result<(), StorageError> {
        self.record = ConfigRecord::default();
        self.store()
    }

    /// Modify the active record and persist the result
    pub fn update<F>(&mut self, f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut ConfigRecord),
    {
        f(&mut self.record);
        self.store()
    }

    /// Log every field of the active record
    pub fn print(&self) {
        let r = &self.record;
        info!("debug_logging: {}", r.debug_logging);
        info!("imu_enabled: {}", r.imu_enabled);
        info!("gps_enabled: {}", r.gps_enabled);
        info!("gyro_bias: {:?}", r.gyro_bias);
        info!("accel_bias: {:?}", r.accel_bias);
        info!("mag_scale: {:?}", r.mag_scale);
        info!("mag_bias: {:?}", r.mag_bias);
        info!("checksum: {}", r.checksum());
    }
}
