use std::path::Path;
use std::time::Duration;

use config::{Config, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::error::Error;

/// Runtime-tunable knobs the firmware needs a concrete value for at
/// startup. Anything a user can recalibrate (scale factor/offset) or
/// retune (thresholds, hopper pulse widths) lives here rather than as a
/// source constant, the same separation `PdmConfig`/`OnyxCameraConfig`
/// draw between "device identity" and "device tuning".
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Counts-per-gram conversion factor from the last successful
    /// calibration. `1.0` until a calibration has run.
    pub scale_factor: f64,
    /// Raw ADC counts read with an empty, tared hopper.
    pub scale_zero_offset: i32,
    /// Number of successful conversions averaged into one published
    /// continuous-sampling window.
    pub scale_average_samples: usize,
    /// Number of raw samples averaged into a blocking tare reading.
    pub scale_tare_samples: usize,
    /// Number of raw samples averaged into a blocking calibration reading.
    pub scale_calibrate_samples: usize,
    /// Pulse width, in microseconds, commanded to fully open a hopper gate.
    pub hopper_open_pulse_us: u16,
    /// Pulse width, in microseconds, commanded to fully close a hopper gate.
    pub hopper_closed_pulse_us: u16,
    /// Minimum weight delta, in grams, that counts as dispensing progress.
    pub dispensing_progress_threshold_g: f32,
    /// How long the engine tolerates zero progress before declaring a stall.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub dispensing_stall_timeout: Duration,
    /// How long the hub will wait to acquire a named lock before returning
    /// [`Error::LockTimeout`].
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub lock_acquire_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            scale_factor: 1.0,
            scale_zero_offset: 0,
            scale_average_samples: 19,
            scale_tare_samples: 10,
            scale_calibrate_samples: 20,
            hopper_open_pulse_us: 2000,
            hopper_closed_pulse_us: 1000,
            dispensing_progress_threshold_g: 3.0,
            dispensing_stall_timeout: Duration::from_millis(10_000),
            lock_acquire_timeout: Duration::from_millis(2_000),
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    /// Loads settings from a YAML file, falling back to nothing: a missing
    /// or malformed file is a hard startup error, matching
    /// `PdmConfig::from_file`'s behaviour for device configuration.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let built = Config::builder()
            .add_source(File::new(
                path.to_str().ok_or_else(|| {
                    Error::Config(format!("non-utf8 settings path: {}", path.display()))
                })?,
                FileFormat::Yaml,
            ))
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;
        built
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Writes the current settings back out as YAML, the local stand-in for
    /// whatever richer settings-persistence service owns this file in the
    /// full product (spec section 1's external settings collaborator).
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let yaml = serde_yaml::to_string(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, yaml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_settings_round_trip_through_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        let original = Settings::default();
        original.save_to_file(&path).unwrap();
        let reloaded = Settings::from_file(&path).unwrap();
        assert_eq!(original, reloaded);
    }

    #[test]
    fn malformed_settings_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "not: [valid, settings").unwrap();
        assert!(Settings::from_file(&path).is_err());
    }
}
