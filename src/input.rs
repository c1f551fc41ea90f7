//! Binary input sources polled by the follower loop
//!
//! Debounce and sampling rate belong to the source; the follower only sees
//! levels.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::{EverlineError, Result};

/// Current level of the monitored line
pub trait InputSource: Send {
    fn read_level(&mut self) -> Result<bool>;
}

/// Level held in memory, settable from another handle.
#[derive(Debug, Clone, Default)]
pub struct SharedLevel {
    level: Arc<AtomicBool>,
}

impl SharedLevel {
    pub fn new(initial: bool) -> Self {
        Self { level: Arc::new(AtomicBool::new(initial)) }
    }

    pub fn set(&self, level: bool) {
        self.level.store(level, Ordering::SeqCst);
    }

    pub fn toggle(&self) -> bool {
        !self.level.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn get(&self) -> bool {
        self.level.load(Ordering::SeqCst)
    }
}

impl InputSource for SharedLevel {
    fn read_level(&mut self) -> Result<bool> {
        Ok(self.get())
    }
}

/// Linux sysfs GPIO value file (`/sys/class/gpio/gpioN/value`) or any file
/// whose first non-blank character is `0` or `1`.
#[derive(Debug, Clone)]
pub struct SysfsGpioInput {
    path: PathBuf,
}

impl SysfsGpioInput {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InputSource for SysfsGpioInput {
    fn read_level(&mut self) -> Result<bool> {
        let raw = fs::read_to_string(&self.path)
            .map_err(|e| EverlineError::Input(format!("{}: {}", self.path.display(), e)))?;
        match raw.trim_start().chars().next() {
            Some('1') => Ok(true),
            Some('0') => Ok(false),
            _ => Err(EverlineError::Input(format!(
                "{}: unexpected value {:?}",
                self.path.display(),
                raw.trim()
            ))),
        }
    }
}
