//! Acquisition metadata stored next to raw files.
//!
//! Every `.raw` file written by the acquisition scripts has a `.json` sidecar
//! with the run parameters. Only `chip_ID` matters for decoding: the chip
//! name tells whether the pixel multiplexer is present. OPAMP runs add a
//! separate scope settings file describing the oscilloscope record length.

use crate::opamp::ScopeLayout;
use crate::types::{ChipVariant, SampleWidth};
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

/// Chip name pattern: `[E][R][1]A{A,F}<pitch><flavour><M>_W<wafer>B<position>`.
pub const CHIP_ID_PATTERN: &str =
    r"^[E]?[R]?[1]?A[AF]([12]?[05]?)([BP])?([M])?_(W\d{2})(B\d{1})";

/// Errors raised while reading run metadata.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Chip ID '{0}' does not match the chip naming scheme")]
    ChipId(String),

    #[error("Invalid scope settings: {0}")]
    Settings(String),
}

/// Contents of a run's `.json` sidecar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sidecar {
    #[serde(rename = "chip_ID", default)]
    pub chip_id: Option<String>,

    /// All other acquisition parameters, kept as written
    #[serde(flatten)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl Sidecar {
    /// Reads a sidecar file.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Path of the sidecar belonging to a raw file.
    pub fn path_for(raw: &Path) -> PathBuf {
        raw.with_extension("json")
    }

    /// Reads the sidecar of `raw` if there is one.
    pub fn for_raw_file(raw: &Path) -> Result<Option<Self>, ConfigError> {
        let path = Self::path_for(raw);
        if !path.exists() {
            warn!("{} not found", path.display());
            return Ok(None);
        }
        Self::read(path).map(Some)
    }

    /// Parsed chip name, if the sidecar has one.
    pub fn chip(&self) -> Option<Result<ChipId, ConfigError>> {
        self.chip_id.as_deref().map(str::parse)
    }

    /// Chip variant for the run. A missing `chip_ID` assumes the standard mapping.
    pub fn variant(&self) -> Result<ChipVariant, ConfigError> {
        match self.chip() {
            Some(chip) => Ok(chip?.variant()),
            None => {
                warn!("chip_ID not found in sidecar, assuming a non-multiplexed chip");
                Ok(ChipVariant::Standard)
            }
        }
    }
}

/// Parsed APTS/OPAMP chip name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipId {
    /// Pixel pitch in micrometres (10, 15, 20, 25)
    pub pitch: Option<u8>,
    /// Process flavour, `B` or `P`
    pub flavour: Option<char>,
    pub mux: bool,
    /// Wafer, e.g. `W22`
    pub wafer: String,
    /// Position on the wafer, e.g. `B6`
    pub position: String,
}

fn chip_id_regex() -> &'static Regex {
    static CHIP_ID: OnceLock<Regex> = OnceLock::new();
    CHIP_ID.get_or_init(|| Regex::new(CHIP_ID_PATTERN).expect("chip ID pattern is valid"))
}

impl ChipId {
    pub fn variant(&self) -> ChipVariant {
        if self.mux {
            ChipVariant::Mux
        } else {
            ChipVariant::Standard
        }
    }
}

impl FromStr for ChipId {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = chip_id_regex()
            .captures(s)
            .ok_or_else(|| ConfigError::ChipId(s.to_string()))?;

        let pitch = caps
            .get(1)
            .map(|m| m.as_str())
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<u8>().map_err(|_| ConfigError::ChipId(s.to_string())))
            .transpose()?;

        Ok(Self {
            pitch,
            flavour: caps.get(2).and_then(|m| m.as_str().chars().next()),
            mux: caps.get(3).is_some(),
            wafer: caps[4].to_string(),
            position: caps[5].to_string(),
        })
    }
}

fn default_ntrg() -> u32 {
    100
}

fn default_connections() -> BTreeMap<String, String> {
    [("1", "J5"), ("2", "J6"), ("3", "J9"), ("4", "J10")]
        .into_iter()
        .map(|(ch, pixel)| (ch.to_string(), pixel.to_string()))
        .collect()
}

/// Oscilloscope settings used during an OPAMP acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSettings {
    #[serde(default = "default_ntrg")]
    pub ntrg: u32,

    /// Scope channel to pixel connector
    #[serde(default = "default_connections")]
    pub inner_pixel_connections: BTreeMap<String, String>,

    /// Horizontal scale in seconds per division
    pub time_division: f64,

    /// Sampling period in seconds
    pub scope_sampling_period: f64,
}

impl Default for ScopeSettings {
    fn default() -> Self {
        Self {
            ntrg: default_ntrg(),
            inner_pixel_connections: default_connections(),
            time_division: 2e-9,
            scope_sampling_period: 0.0625e-9,
        }
    }
}

impl ScopeSettings {
    /// Number of divisions on the scope screen.
    pub const TIME_DIVISIONS: u32 = 10;

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn channels(&self) -> usize {
        self.inner_pixel_connections.len()
    }

    /// Samples per waveform: `time_divisions * time_division / sampling_period`,
    /// rounded half to even.
    pub fn samples(&self, time_divisions: u32) -> Result<usize, ConfigError> {
        if !(self.scope_sampling_period > 0.0) || !(self.time_division >= 0.0) {
            return Err(ConfigError::Settings(format!(
                "time_division {} and scope_sampling_period {} must be positive",
                self.time_division, self.scope_sampling_period
            )));
        }
        let samples =
            (f64::from(time_divisions) * self.time_division / self.scope_sampling_period)
                .round_ties_even();
        if !samples.is_finite() || samples >= usize::MAX as f64 {
            return Err(ConfigError::Settings(format!(
                "record length {} does not fit in memory",
                samples
            )));
        }
        Ok(samples as usize)
    }

    /// Scope record layout for a given sample width.
    pub fn layout(
        &self,
        sample_width: SampleWidth,
        time_divisions: u32,
    ) -> Result<ScopeLayout, ConfigError> {
        Ok(ScopeLayout {
            channels: self.channels(),
            samples: self.samples(time_divisions)?,
            sample_width,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_chip_id_standard() {
        let chip: ChipId = "AF15P_W22B6".parse().unwrap();
        assert_eq!(chip.pitch, Some(15));
        assert_eq!(chip.flavour, Some('P'));
        assert!(!chip.mux);
        assert_eq!(chip.wafer, "W22");
        assert_eq!(chip.position, "B6");
        assert_eq!(chip.variant(), ChipVariant::Standard);
    }

    #[test]
    fn test_chip_id_mux() {
        let chip: ChipId = "ER1AF10BM_W21B3".parse().unwrap();
        assert_eq!(chip.pitch, Some(10));
        assert!(chip.mux);
        assert_eq!(chip.variant(), ChipVariant::Mux);
    }

    #[test]
    fn test_chip_id_without_pitch() {
        let chip: ChipId = "AF_W22B5".parse().unwrap();
        assert_eq!(chip.pitch, None);
        assert_eq!(chip.flavour, None);
    }

    #[test]
    fn test_chip_id_invalid() {
        assert!(matches!(
            "DPTS_W22".parse::<ChipId>(),
            Err(ConfigError::ChipId(id)) if id == "DPTS_W22"
        ));
    }

    #[test]
    fn test_sidecar_variant() {
        let sidecar: Sidecar =
            serde_json::from_str(r#"{"chip_ID": "AF15PM_W22B6", "vbb": -1.2}"#).unwrap();
        assert_eq!(sidecar.variant().unwrap(), ChipVariant::Mux);
        assert_eq!(sidecar.parameters["vbb"], serde_json::json!(-1.2));
    }

    #[test]
    fn test_sidecar_without_chip_id() {
        let sidecar: Sidecar = serde_json::from_str(r#"{"ntrg": 10}"#).unwrap();
        assert_eq!(sidecar.chip_id, None);
        assert_eq!(sidecar.variant().unwrap(), ChipVariant::Standard);
    }

    #[test]
    fn test_sidecar_for_raw_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("apts_run.raw");
        assert!(Sidecar::for_raw_file(&raw).unwrap().is_none());

        let mut json = std::fs::File::create(dir.path().join("apts_run.json")).unwrap();
        write!(json, r#"{{"chip_ID": "AF20B_W13B1"}}"#).unwrap();
        drop(json);

        let sidecar = Sidecar::for_raw_file(&raw).unwrap().unwrap();
        assert_eq!(sidecar.chip_id.as_deref(), Some("AF20B_W13B1"));
    }

    #[test]
    fn test_scope_settings_defaults() {
        let settings = ScopeSettings::default();
        assert_eq!(settings.channels(), 4);
        assert_eq!(settings.samples(ScopeSettings::TIME_DIVISIONS).unwrap(), 320);

        let layout = settings.layout(SampleWidth::I16, 10).unwrap();
        assert_eq!(layout.channels, 4);
        assert_eq!(layout.samples, 320);
        assert_eq!(layout.sample_width, SampleWidth::I16);
    }

    #[test]
    fn test_scope_settings_from_json() {
        let settings: ScopeSettings = serde_json::from_str(
            r#"{"inner_pixel_connections": {"1": "J5", "2": "J6"},
                "time_division": 5e-9, "scope_sampling_period": 0.25e-9}"#,
        )
        .unwrap();
        assert_eq!(settings.ntrg, 100);
        assert_eq!(settings.channels(), 2);
        assert_eq!(settings.samples(10).unwrap(), 200);
    }

    #[test]
    fn test_scope_settings_rejects_zero_period() {
        let settings = ScopeSettings {
            scope_sampling_period: 0.0,
            ..ScopeSettings::default()
        };
        assert!(matches!(
            settings.samples(10),
            Err(ConfigError::Settings(_))
        ));
    }

    #[test]
    fn test_scope_settings_rejects_huge_record() {
        let settings = ScopeSettings {
            time_division: 1e30,
            ..ScopeSettings::default()
        };
        assert!(matches!(
            settings.samples(10),
            Err(ConfigError::Settings(_))
        ));
    }
}
