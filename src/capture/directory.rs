use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::error::ResourceError;

use super::{CapturedImage, FrameSource};

#[derive(Clone, Debug)]
pub struct DirectoryConfig {
    pub path: PathBuf,
    /// Dimensions reported for every file; the bytes are passed through as-is.
    pub width: u16,
    pub height: u16,
    /// Pause between files. Zero replays as fast as requested.
    pub interval: Duration,
}

/// Replays the files of a directory in name order, looping forever.
///
/// Files are sent as pre-encoded image bytes; nothing here decodes them.
pub struct DirectorySource {
    config: DirectoryConfig,
    files: Vec<PathBuf>,
    cursor: usize,
}

impl DirectorySource {
    pub fn new(config: DirectoryConfig) -> Self {
        Self {
            config,
            files: Vec::new(),
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn capture_error(&self, reason: impl Into<String>) -> ResourceError {
        ResourceError::Capture {
            device: self.describe(),
            reason: reason.into(),
        }
    }
}

impl FrameSource for DirectorySource {
    fn describe(&self) -> String {
        format!("directory {}", self.config.path.display())
    }

    fn open(&mut self) -> Result<(), ResourceError> {
        let entries = fs::read_dir(&self.config.path).map_err(|e| self.capture_error(e.to_string()))?;
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| self.capture_error(e.to_string()))?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(self.capture_error("no image files found"));
        }
        files.sort();
        log::info!("{}: {} files", self.describe(), files.len());
        self.files = files;
        self.cursor = 0;
        Ok(())
    }

    fn next_image(&mut self) -> Result<CapturedImage> {
        let path = self
            .files
            .get(self.cursor)
            .cloned()
            .with_context(|| format!("{} was not opened", self.describe()))?;
        self.cursor = (self.cursor + 1) % self.files.len();
        if !self.config.interval.is_zero() {
            std::thread::sleep(self.config.interval);
        }
        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        Ok(CapturedImage {
            width: self.config.width,
            height: self.config.height,
            bytes,
        })
    }
}
