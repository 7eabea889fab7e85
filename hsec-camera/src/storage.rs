//! File-backed session slot.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use hsec_core::session::RECORD_LEN;
use hsec_core::{Slot, StoreError};
use tracing::debug;

const ERASED: u8 = 0xFF;

/// Holds the slot in memory; `commit` replaces the file atomically (write temp, rename).
pub struct FileSlot {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl FileSlot {
    /// Open the slot at `path`. A missing file reads as erased.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => vec![ERASED; RECORD_LEN],
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Slot for FileSlot {
    fn read(&self, buf: &mut [u8]) -> Result<(), StoreError> {
        buf.fill(ERASED);
        let n = buf.len().min(self.bytes.len());
        buf[..n].copy_from_slice(&self.bytes[..n]);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), StoreError> {
        if self.bytes.len() < data.len() {
            self.bytes.resize(data.len(), ERASED);
        }
        self.bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &self.bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), "session slot committed");
        Ok(())
    }
}
