//! Persisted top-of-travel record.
//!
//! One small JSON file `{"zmax": <mm>}` holding the last measured true
//! top-of-travel height. Written at the end of a successful alignment
//! home, read by the aligner and by leveling logic. Every read is clamped
//! to the configured maximum travel.

use plumb_common::consts::TOP_OF_TRAVEL_FALLBACK_MARGIN;
use plumb_common::error::{HomingError, HomingResult};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// On-disk record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PersistedTopOfTravel {
    #[serde(rename = "zmax")]
    pub measured_max_z: f64,
}

/// Reader/writer for [`PersistedTopOfTravel`].
#[derive(Debug, Clone)]
pub struct TopOfTravelStore {
    path: PathBuf,
    /// Configured maximum vertical travel [mm].
    max_travel: f64,
}

impl TopOfTravelStore {
    pub fn new<P: AsRef<Path>>(path: P, max_travel: f64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_travel,
        }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn max_travel(&self) -> f64 {
        self.max_travel
    }

    /// Value used when no usable record exists.
    #[inline]
    pub fn fallback(&self) -> f64 {
        self.max_travel - TOP_OF_TRAVEL_FALLBACK_MARGIN
    }

    /// Read the record, never returning more than the configured maximum.
    ///
    /// A missing, unreadable, non-finite or negative record yields
    /// [`fallback`](Self::fallback).
    pub fn read(&self) -> f64 {
        debug!("Reading top-of-travel from {:?}", self.path);

        if !self.path.exists() {
            debug!("No top-of-travel record, using {}", self.fallback());
            return self.fallback();
        }

        let record = fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|s| {
                serde_json::from_str::<PersistedTopOfTravel>(&s).map_err(|e| e.to_string())
            });

        match record {
            Ok(r) if r.measured_max_z.is_finite() && r.measured_max_z >= 0.0 => {
                let value = r.measured_max_z.min(self.max_travel);
                if value < r.measured_max_z {
                    warn!(
                        "Persisted top-of-travel {} exceeds max travel, clamped to {}",
                        r.measured_max_z, value
                    );
                }
                value
            }
            Ok(r) => {
                warn!(
                    "Persisted top-of-travel {} is invalid, using {}",
                    r.measured_max_z,
                    self.fallback()
                );
                self.fallback()
            }
            Err(e) => {
                warn!(
                    "Failed to read top-of-travel record {:?}: {}",
                    self.path, e
                );
                self.fallback()
            }
        }
    }

    /// Write `value`, clamped to the configured maximum. Returns the value
    /// actually stored.
    pub fn write(&self, value: f64) -> HomingResult<f64> {
        if !value.is_finite() {
            return Err(HomingError::Persistence {
                reason: format!("refusing to persist non-finite top-of-travel {value}"),
            });
        }
        let stored = value.min(self.max_travel);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| HomingError::Persistence {
                    reason: format!("Failed to create directory: {e}"),
                })?;
            }
        }

        let file = File::create(&self.path).map_err(|e| HomingError::Persistence {
            reason: format!("Failed to create record file: {e}"),
        })?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(
            &mut writer,
            &PersistedTopOfTravel {
                measured_max_z: stored,
            },
        )
        .map_err(|e| HomingError::Persistence {
            reason: format!("Failed to serialize record: {e}"),
        })?;
        writer.flush().map_err(|e| HomingError::Persistence {
            reason: format!("Failed to flush record: {e}"),
        })?;

        info!("Persisted top-of-travel {:.4} to {:?}", stored, self.path);
        Ok(stored)
    }
}
