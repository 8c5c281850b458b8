//! Acquisition parameters and digitizer mode
//!
//! Settings persist as JSON. Missing fields fall back to defaults so older
//! files keep loading.

use crate::error::{DigitizerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

fn default_record_length() -> usize {
    1024
}

fn default_count() -> usize {
    1
}

/// Which sink the router feeds during an acquisition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigitizerMode {
    /// Raw records into per-stream queues (or sockets)
    Digitizer,
    /// Running averages and correlations
    #[default]
    Averager,
}

impl fmt::Display for DigitizerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigitizerMode::Digitizer => f.write_str("digitizer"),
            DigitizerMode::Averager => f.write_str("averager"),
        }
    }
}

impl std::str::FromStr for DigitizerMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "digitizer" => Ok(DigitizerMode::Digitizer),
            "averager" => Ok(DigitizerMode::Averager),
            other => Err(format!("unknown mode '{}' (expected digitizer or averager)", other)),
        }
    }
}

/// Acquisition parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Record length in ADC samples
    #[serde(default = "default_record_length")]
    pub record_length: usize,
    /// Distinct segments averaged separately
    #[serde(default = "default_count")]
    pub num_segments: usize,
    /// Consecutive records per segment
    #[serde(default = "default_count")]
    pub num_waveforms: usize,
    /// Passes over all segments
    #[serde(default = "default_count")]
    pub round_robins: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            record_length: default_record_length(),
            num_segments: default_count(),
            num_waveforms: default_count(),
            round_robins: default_count(),
        }
    }
}

impl AcquisitionSettings {
    pub fn new(
        record_length: usize,
        num_segments: usize,
        num_waveforms: usize,
        round_robins: usize,
    ) -> Self {
        Self {
            record_length,
            num_segments,
            num_waveforms,
            round_robins,
        }
    }

    /// Records every stream must take before the acquisition is done
    pub fn num_records(&self) -> u64 {
        (self.num_segments * self.num_waveforms * self.round_robins) as u64
    }

    /// Check every field without touching any state
    pub fn validate(&self) -> Result<()> {
        validate_record_length(self.record_length)?;
        for (name, value) in [
            ("num_segments", self.num_segments),
            ("num_waveforms", self.num_waveforms),
            ("round_robins", self.round_robins),
        ] {
            if value == 0 {
                return Err(DigitizerError::InvalidSettings(format!(
                    "{} must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&contents)?;
        tracing::info!(path = %path.display(), "Loaded acquisition settings");
        Ok(settings)
    }

    /// Load settings, falling back to defaults on any error
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(settings) => settings,
            Err(DigitizerError::Transport(_)) => {
                tracing::info!(path = %path.display(), "No settings file found, using defaults");
                Self::default()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to parse settings, using defaults");
                Self::default()
            }
        }
    }

    /// Save settings as pretty JSON, creating parent directories if needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!(path = %path.display(), "Acquisition settings saved");
        Ok(())
    }
}

/// Record length must be within bounds and a multiple of the granularity
pub fn validate_record_length(record_length: usize) -> Result<()> {
    if record_length < crate::MIN_RECORD_LENGTH {
        return Err(DigitizerError::RecordLengthTooShort(record_length));
    }
    if record_length > crate::MAX_RECORD_LENGTH {
        return Err(DigitizerError::RecordLengthTooLong(record_length));
    }
    if record_length % crate::RECORD_LENGTH_GRANULARITY != 0 {
        return Err(DigitizerError::RecordLengthGranularity(record_length));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = AcquisitionSettings::default();
        assert_eq!(settings.record_length, 1024);
        assert_eq!(settings.num_records(), 1);
        assert!(settings.validate().is_ok());
        assert_eq!(DigitizerMode::default(), DigitizerMode::Averager);
    }

    #[test]
    fn test_num_records() {
        let settings = AcquisitionSettings::new(256, 4, 3, 5);
        assert_eq!(settings.num_records(), 60);
    }

    #[test]
    fn test_record_length_bounds() {
        assert!(matches!(
            validate_record_length(0),
            Err(DigitizerError::RecordLengthTooShort(0))
        ));
        assert!(matches!(
            validate_record_length(64),
            Err(DigitizerError::RecordLengthTooShort(64))
        ));
        assert!(validate_record_length(128).is_ok());
        assert!(validate_record_length(16384).is_ok());
        assert!(matches!(
            validate_record_length(16512),
            Err(DigitizerError::RecordLengthTooLong(16512))
        ));
        assert!(matches!(
            validate_record_length(200),
            Err(DigitizerError::RecordLengthGranularity(200))
        ));
    }

    #[test]
    fn test_zero_counts_rejected() {
        let err = AcquisitionSettings::new(256, 0, 1, 1).validate().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("num_segments"));
        assert!(AcquisitionSettings::new(256, 1, 0, 1).validate().is_err());
        assert!(AcquisitionSettings::new(256, 1, 1, 0).validate().is_err());
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let json = r#"{"num_segments": 8}"#;
        let settings: AcquisitionSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.num_segments, 8);
        assert_eq!(settings.record_length, 1024);
        assert_eq!(settings.round_robins, 1);
    }

    #[test]
    fn test_mode_names() {
        assert_eq!(serde_json::to_string(&DigitizerMode::Digitizer).unwrap(), "\"digitizer\"");
        assert_eq!("Averager".parse::<DigitizerMode>().unwrap(), DigitizerMode::Averager);
        assert!("scope".parse::<DigitizerMode>().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = AcquisitionSettings::new(2048, 2, 3, 4);
        settings.save(&path).unwrap();
        assert_eq!(AcquisitionSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_load_or_default_on_bad_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        assert_eq!(
            AcquisitionSettings::load_or_default(&missing),
            AcquisitionSettings::default()
        );

        let garbage = dir.path().join("garbage.json");
        std::fs::write(&garbage, "not json").unwrap();
        assert_eq!(
            AcquisitionSettings::load_or_default(&garbage),
            AcquisitionSettings::default()
        );
    }
}
