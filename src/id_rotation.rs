// Copyright 2021, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Factory reset detection for the unique id rotation privacy feature.
//! Attestations may carry a RESET_SINCE_ID_ROTATION marker; it is set while
//! the device is within one rotation period of a factory reset.
//!
//! The timestamp file does not survive a factory reset, so its creation
//! time provides a lower bound for the time since the reset. The file is
//! never written after creation.

use crate::ks_err;
use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const ID_ROTATION_PERIOD: Duration = Duration::from_secs(30 * 24 * 60 * 60); // Thirty days.
static TIMESTAMP_FILE_NAME: &str = "timestamp";
const TIMESTAMP_FILE_MODE: u32 = 0o600;

/// Holds the path to the timestamp file for deferred use. The working
/// directory may not be available at service start, so the check runs on
/// demand.
#[derive(Debug, Clone)]
pub struct IdRotationState {
    timestamp_path: PathBuf,
}

impl IdRotationState {
    /// Creates a new IdRotationState rooted at the service's working
    /// directory.
    pub fn new(working_dir: &Path) -> Self {
        let mut timestamp_path = working_dir.to_owned();
        timestamp_path.push(TIMESTAMP_FILE_NAME);
        Self { timestamp_path }
    }

    /// Returns true iff a factory reset occurred within the current id
    /// rotation period. Creates the timestamp file if it does not exist, in
    /// which case the reset is considered recent.
    pub fn had_factory_reset_since_id_rotation(&self) -> Result<bool> {
        match fs::metadata(&self.timestamp_path) {
            Ok(metadata) => {
                // The file is created once and never touched, so mtime is
                // the creation time.
                let created =
                    metadata.modified().context(ks_err!("File creation time not supported."))?;
                let age = SystemTime::now()
                    .duration_since(created)
                    .unwrap_or_else(|_| Duration::from_secs(0));
                Ok(age < ID_ROTATION_PERIOD)
            }
            Err(e) => match e.kind() {
                ErrorKind::NotFound => {
                    fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(TIMESTAMP_FILE_MODE)
                        .open(&self.timestamp_path)
                        .context(ks_err!("Failed to create timestamp file."))?;
                    Ok(true)
                }
                _ => Err(e).context(ks_err!("Failed to stat timestamp file.")),
            },
        }
    }
}
