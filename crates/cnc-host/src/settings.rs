//! The `$` settings record: strongly-typed fields, numbered access for
//! the serial protocol, and version-prefixed persistence standing in for
//! the EEPROM of a real controller.

use anyhow::{Context, Result};
use motion::{PlannerConfig, N_AXIS};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::PathBuf;
use stepper::StepperConfig;
use tracing::warn;

use crate::errors::ProtocolError;

/// Bumped whenever the record layout changes; a mismatch on load forces a
/// defaults write.
pub const SETTINGS_VERSION: u8 = 5;

pub const N_STARTUP_LINES: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub steps_per_mm: [f32; N_AXIS],
    pub pulse_microseconds: u8,
    pub default_feed_rate: f32,
    pub default_seek_rate: f32,
    pub invert_mask: u8,
    pub stepper_idle_lock_time: u8,
    /// mm/min².
    pub acceleration: f32,
    pub junction_deviation: f32,
    pub mm_per_arc_segment: f32,
    pub n_arc_correction: u8,
    pub decimal_places: u8,
    pub report_inches: bool,
    pub auto_start: bool,
    pub invert_step_enable: bool,
    pub hard_limit_enable: bool,
    pub homing_enable: bool,
    pub homing_dir_mask: u8,
    pub homing_feed_rate: f32,
    pub homing_seek_rate: f32,
    pub homing_debounce_delay: u16,
    pub homing_pulloff: f32,
    pub startup_lines: [String; N_STARTUP_LINES],
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            steps_per_mm: [250.0, 250.0, 250.0],
            pulse_microseconds: 10,
            default_feed_rate: 250.0,
            default_seek_rate: 500.0,
            invert_mask: 0,
            stepper_idle_lock_time: 25,
            acceleration: 36_000.0, // 10 mm/s²
            junction_deviation: 0.05,
            mm_per_arc_segment: 0.1,
            n_arc_correction: 25,
            decimal_places: 3,
            report_inches: false,
            auto_start: true,
            invert_step_enable: false,
            hard_limit_enable: false,
            homing_enable: false,
            homing_dir_mask: 0,
            homing_feed_rate: 25.0,
            homing_seek_rate: 250.0,
            homing_debounce_delay: 100,
            homing_pulloff: 1.0,
            startup_lines: [String::new(), String::new()],
        }
    }
}

impl Settings {
    /// Assign a numbered setting from the `$x=value` command.
    pub fn set_numeric(&mut self, index: u8, value: f32) -> Result<(), ProtocolError> {
        if value < 0.0 {
            return Err(ProtocolError::SettingOutOfRange);
        }
        match index {
            0..=2 => {
                if value <= 0.0 {
                    return Err(ProtocolError::SettingOutOfRange);
                }
                self.steps_per_mm[index as usize] = value;
            }
            3 => {
                if value < 3.0 {
                    return Err(ProtocolError::StepPulseTooShort);
                }
                self.pulse_microseconds = value as u8;
            }
            4 => self.default_feed_rate = value,
            5 => self.default_seek_rate = value,
            6 => self.invert_mask = value as u8,
            7 => self.stepper_idle_lock_time = value as u8,
            8 => {
                if value <= 0.0 {
                    return Err(ProtocolError::SettingOutOfRange);
                }
                self.acceleration = value;
            }
            9 => self.junction_deviation = value,
            10 => self.mm_per_arc_segment = value,
            11 => self.n_arc_correction = value as u8,
            12 => self.decimal_places = value as u8,
            13 => self.report_inches = value != 0.0,
            14 => self.auto_start = value != 0.0,
            15 => self.invert_step_enable = value != 0.0,
            16 => self.hard_limit_enable = value != 0.0,
            17 => self.homing_enable = value != 0.0,
            18 => self.homing_dir_mask = value as u8,
            19 => self.homing_feed_rate = value,
            20 => self.homing_seek_rate = value,
            21 => self.homing_debounce_delay = value as u16,
            22 => self.homing_pulloff = value,
            _ => return Err(ProtocolError::InvalidSetting),
        }
        Ok(())
    }

    /// The `$$` dump, one numbered line per field.
    pub fn dump(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let axis_names = ["x", "y", "z"];
        for i in 0..N_AXIS {
            lines.push(format!(
                "${}={:.3} ({}, step/mm)",
                i, self.steps_per_mm[i], axis_names[i]
            ));
        }
        lines.push(format!("$3={} (step pulse, usec)", self.pulse_microseconds));
        lines.push(format!(
            "$4={:.3} (default feed, mm/min)",
            self.default_feed_rate
        ));
        lines.push(format!(
            "$5={:.3} (default seek, mm/min)",
            self.default_seek_rate
        ));
        lines.push(format!("$6={} (step port invert mask)", self.invert_mask));
        lines.push(format!(
            "$7={} (step idle delay, msec)",
            self.stepper_idle_lock_time
        ));
        lines.push(format!("$8={:.3} (acceleration, mm/min^2)", self.acceleration));
        lines.push(format!(
            "$9={:.3} (junction deviation, mm)",
            self.junction_deviation
        ));
        lines.push(format!("$10={:.3} (arc, mm/segment)", self.mm_per_arc_segment));
        lines.push(format!(
            "$11={} (n-arc correction, int)",
            self.n_arc_correction
        ));
        lines.push(format!("$12={} (n-decimals, int)", self.decimal_places));
        lines.push(format!(
            "$13={} (report inches, bool)",
            self.report_inches as u8
        ));
        lines.push(format!("$14={} (auto start, bool)", self.auto_start as u8));
        lines.push(format!(
            "$15={} (invert step enable, bool)",
            self.invert_step_enable as u8
        ));
        lines.push(format!(
            "$16={} (hard limits, bool)",
            self.hard_limit_enable as u8
        ));
        lines.push(format!(
            "$17={} (homing cycle, bool)",
            self.homing_enable as u8
        ));
        lines.push(format!(
            "$18={} (homing dir invert mask)",
            self.homing_dir_mask
        ));
        lines.push(format!(
            "$19={:.3} (homing feed, mm/min)",
            self.homing_feed_rate
        ));
        lines.push(format!(
            "$20={:.3} (homing seek, mm/min)",
            self.homing_seek_rate
        ));
        lines.push(format!(
            "$21={} (homing debounce, msec)",
            self.homing_debounce_delay
        ));
        lines.push(format!(
            "$22={:.3} (homing pull-off, mm)",
            self.homing_pulloff
        ));
        lines
    }

    /// Startup-line listing for `$N`.
    pub fn dump_startup_lines(&self) -> Vec<String> {
        self.startup_lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let mut s = String::new();
                let _ = write!(s, "$N{i}={line}");
                s
            })
            .collect()
    }

    /// Planner tuning derived from this record. The single acceleration
    /// setting applies to every axis.
    pub fn planner_config(&self) -> PlannerConfig {
        PlannerConfig {
            steps_per_mm: self.steps_per_mm,
            acceleration: [self.acceleration; N_AXIS],
            junction_deviation: self.junction_deviation,
        }
    }

    pub fn stepper_config(&self) -> StepperConfig {
        StepperConfig {
            pulse_microseconds: self.pulse_microseconds,
            pulse_delay_microseconds: 0,
            invert_mask: self.invert_mask,
            invert_step_enable: self.invert_step_enable,
            idle_lock_time_ms: self.stepper_idle_lock_time,
        }
    }

    /// Serialize as the persisted record: a version byte followed by the
    /// postcard body.
    pub fn to_record(&self) -> Result<Vec<u8>> {
        let mut record = vec![SETTINGS_VERSION];
        let body = postcard::to_stdvec(self).context("serializing settings record")?;
        record.extend_from_slice(&body);
        Ok(record)
    }

    /// Parse a persisted record; `None` on version mismatch or corruption.
    pub fn from_record(record: &[u8]) -> Option<Self> {
        let (&version, body) = record.split_first()?;
        if version != SETTINGS_VERSION {
            return None;
        }
        postcard::from_bytes(body).ok()
    }
}

/// Backing store for the settings record.
pub trait SettingsStore {
    fn read(&mut self) -> Result<Option<Vec<u8>>>;
    fn write(&mut self, record: &[u8]) -> Result<()>;
}

/// File-backed store, the host's stand-in for EEPROM.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SettingsStore for FileStore {
    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {:?}", self.path)),
        }
    }

    fn write(&mut self, record: &[u8]) -> Result<()> {
        std::fs::write(&self.path, record).with_context(|| format!("writing {:?}", self.path))
    }
}

/// In-memory store for tests and batch runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub record: Option<Vec<u8>>,
}

impl SettingsStore for MemoryStore {
    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.record.clone())
    }

    fn write(&mut self, record: &[u8]) -> Result<()> {
        self.record = Some(record.to_vec());
        Ok(())
    }
}

/// Load settings from the store, falling back to (and persisting)
/// defaults on a missing, stale, or unreadable record.
pub fn load_or_default<S: SettingsStore>(store: &mut S) -> Settings {
    let stored = match store.read() {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(%err, "settings store unreadable, using defaults");
            None
        }
    };
    if let Some(bytes) = stored {
        if let Some(settings) = Settings::from_record(&bytes) {
            return settings;
        }
        warn!("settings record version mismatch, rewriting defaults");
    }
    let defaults = Settings::default();
    if let Ok(record) = defaults.to_record() {
        if let Err(err) = store.write(&record) {
            warn!(%err, "could not persist default settings");
        }
    }
    defaults
}
