// Persistent media for the configuration record
//
// Both backends behave like an erased EEPROM: bytes that were never written
// read back as 0xFF.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use tracing::debug;

pub const ERASED: u8 = 0xFF;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Access of {len} bytes at {address} exceeds capacity {capacity}")]
    OutOfRange {
        address: u64,
        len: usize,
        capacity: usize,
    },
}

/// Byte-addressed persistent medium
pub trait Storage: Send {
    /// Fill `buf` with the bytes stored at `address`
    fn load(&mut self, address: u64, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write `data` at `address`
    fn store(&mut self, address: u64, data: &[u8]) -> Result<(), StorageError>;
}

/// In-process storage with a fixed capacity
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    bytes: Vec<u8>,
}

impl MemoryStorage {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: vec![ERASED; capacity],
        }
    }

    #[cfg(test)]
    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn range(&self, address: u64, len: usize) -> Result<std::ops::Range<usize>, StorageError> {
        let start = address as usize;
        match start.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(start..end),
            _ => Err(StorageError::OutOfRange {
                address,
                len,
                capacity: self.bytes.len(),
            }),
        }
    }
}

impl Storage for MemoryStorage {
    fn load(&mut self, address: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn store(&mut self, address: u64, data: &[u8]) -> Result<(), StorageError> {
        let range = self.range(address, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }
}

/// File emulating an EEPROM; the file grows on demand
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl Storage for FileStorage {
    fn load(&mut self, address: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        buf.fill(ERASED);

        let mut file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} does not exist yet, reading erased bytes", self.path.display());
                return Ok(());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let len = file.metadata().map_err(|e| self.io_error(e))?.len();
        if len <= address {
            return Ok(());
        }
        let available = ((len - address) as usize).min(buf.len());

        file.seek(SeekFrom::Start(address))
            .map_err(|e| self.io_error(e))?;
        file.read_exact(&mut buf[..available])
            .map_err(|e| self.io_error(e))
    }

    fn store(&mut self, address: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;

        let len = file.metadata().map_err(|e| self.io_error(e))?.len();
        if len < address {
            // Keep the gap erased rather than zero-filled
            file.seek(SeekFrom::End(0)).map_err(|e| self.io_error(e))?;
            file.write_all(&vec![ERASED; (address - len) as usize])
                .map_err(|e| self.io_error(e))?;
        }

        file.seek(SeekFrom::Start(address))
            .map_err(|e| self.io_error(e))?;
        file.write_all(data).map_err(|e| self.io_error(e))?;
        file.sync_data().map_err(|e| self.io_error(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_round_trip() {
        let mut storage = MemoryStorage::new(16);
        storage.store(4, &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 5];
        storage.load(3, &mut buf).unwrap();
        assert_eq!(buf, [ERASED, 1, 2, 3, ERASED]);
    }

    #[test]
    fn test_memory_out_of_range() {
        let mut storage = MemoryStorage::new(8);
        assert!(matches!(
            storage.store(6, &[0; 4]),
            Err(StorageError::OutOfRange { .. })
        ));
        let mut buf = [0u8; 4];
        assert!(storage.load(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn test_file_missing_reads_erased() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("eeprom.bin"));

        let mut buf = [0u8; 8];
        storage.load(0, &mut buf).unwrap();
        assert_eq!(buf, [ERASED; 8]);
    }

    #[test]
    fn test_file_round_trip_with_gap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eeprom.bin");
        let mut storage = FileStorage::new(&path);

        storage.store(4, &[9, 8, 7]).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![ERASED, ERASED, ERASED, ERASED, 9, 8, 7]);

        // Partially beyond the end of the file
        let mut buf = [0u8; 5];
        storage.load(4, &mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7, ERASED, ERASED]);

        // Overwrite in place
        storage.store(5, &[1]).unwrap();
        storage.load(4, &mut buf).unwrap();
        assert_eq!(buf, [9, 1, 7, ERASED, ERASED]);
    }
}
