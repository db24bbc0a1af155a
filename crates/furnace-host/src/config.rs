//! Furnace Configuration Loader
//!
//! This module parses the furnace's INI-style configuration file into
//! strongly-typed structs. Every key has a default matching the reference
//! wiring, so a missing file or missing key never prevents the furnace from
//! starting; it is reported and the defaults apply.

use anyhow::{Context, Result};
use configparser::ini::Ini;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Bounds accepted for the control loop period.
pub const TICK_MS_MIN: u64 = 100;
pub const TICK_MS_MAX: u64 = 2000;

/// Represents the [controller] section of the config.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Control loop period in milliseconds, clamped to `[100, 2000]`.
    pub tick_ms: u64,
    /// Time spent in cooldown (fan on) before returning to idle, in seconds.
    pub cooldown_s: u64,
    /// Ambient temperature the simulation model decays toward.
    pub ambient_c: f64,
}

/// Represents the [pid] section.
#[derive(Debug, Clone)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Live proportional auto-adjust. Off by default; enabling it is an
    /// explicit operator choice.
    pub autotune: bool,
}

/// Represents the [pins] section (BCM numbering).
#[derive(Debug, Clone)]
pub struct PinConfig {
    pub heater: u8,
    pub tc_clk: u8,
    pub tc1_cs: u8,
    pub tc1_do: u8,
    pub tc2_cs: u8,
    pub tc2_do: u8,
    pub vacuum: u8,
    pub fan: u8,
    pub door: u8,
    pub emergency: u8,
}

/// Represents the [storage] section.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path of the user-program document.
    pub programs: PathBuf,
}

/// Holds the entire parsed furnace configuration.
#[derive(Debug, Clone)]
pub struct FurnaceConfig {
    pub controller: ControllerConfig,
    pub pid: PidConfig,
    pub pins: PinConfig,
    pub storage: StorageConfig,
}

impl Default for FurnaceConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig {
                tick_ms: 500,
                cooldown_s: 300,
                ambient_c: 20.0,
            },
            pid: PidConfig {
                kp: 3.2,
                ki: 0.08,
                kd: 1.5,
                autotune: false,
            },
            pins: PinConfig {
                heater: 17,
                tc_clk: 11,
                tc1_cs: 8,
                tc1_do: 9,
                tc2_cs: 7,
                tc2_do: 10,
                vacuum: 27,
                fan: 22,
                door: 18,
                emergency: 25,
            },
            storage: StorageConfig {
                programs: PathBuf::from("programs.json"),
            },
        }
    }
}

impl FurnaceConfig {
    /// Loads and parses the configuration file from the given path.
    ///
    /// A missing file yields the defaults with a logged warning. A present but
    /// malformed file is an error: silently firing a kiln with half a config
    /// is worse than refusing to start.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Configuration file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let mut config = Ini::new();
        config
            .load(path)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Failed to load configuration file: {:?}", path))?;

        let defaults = Self::default();

        let tick_ms = uint_or(&config, "controller", "tick_ms", defaults.controller.tick_ms)?
            .clamp(TICK_MS_MIN, TICK_MS_MAX);
        let controller = ControllerConfig {
            tick_ms,
            cooldown_s: uint_or(&config, "controller", "cooldown_s", defaults.controller.cooldown_s)?,
            ambient_c: float_or(&config, "controller", "ambient_c", defaults.controller.ambient_c)?,
        };

        let pid = PidConfig {
            kp: float_or(&config, "pid", "kp", defaults.pid.kp)?,
            ki: float_or(&config, "pid", "ki", defaults.pid.ki)?,
            kd: float_or(&config, "pid", "kd", defaults.pid.kd)?,
            autotune: bool_or(&config, "pid", "autotune", defaults.pid.autotune)?,
        };

        let pins = PinConfig {
            heater: pin_or(&config, "heater", defaults.pins.heater)?,
            tc_clk: pin_or(&config, "tc_clk", defaults.pins.tc_clk)?,
            tc1_cs: pin_or(&config, "tc1_cs", defaults.pins.tc1_cs)?,
            tc1_do: pin_or(&config, "tc1_do", defaults.pins.tc1_do)?,
            tc2_cs: pin_or(&config, "tc2_cs", defaults.pins.tc2_cs)?,
            tc2_do: pin_or(&config, "tc2_do", defaults.pins.tc2_do)?,
            vacuum: pin_or(&config, "vacuum", defaults.pins.vacuum)?,
            fan: pin_or(&config, "fan", defaults.pins.fan)?,
            door: pin_or(&config, "door", defaults.pins.door)?,
            emergency: pin_or(&config, "emergency", defaults.pins.emergency)?,
        };

        let storage = StorageConfig {
            programs: config
                .get("storage", "programs")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage.programs),
        };

        Ok(Self {
            controller,
            pid,
            pins,
            storage,
        })
    }
}

fn uint_or(config: &Ini, section: &str, key: &str, default: u64) -> Result<u64> {
    Ok(config
        .getuint(section, key)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("[{}] {} is not an integer", section, key))?
        .unwrap_or(default))
}

fn float_or(config: &Ini, section: &str, key: &str, default: f64) -> Result<f64> {
    Ok(config
        .getfloat(section, key)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("[{}] {} is not a number", section, key))?
        .unwrap_or(default))
}

fn bool_or(config: &Ini, section: &str, key: &str, default: bool) -> Result<bool> {
    Ok(config
        .getbool(section, key)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("[{}] {} is not a boolean", section, key))?
        .unwrap_or(default))
}

fn pin_or(config: &Ini, key: &str, default: u8) -> Result<u8> {
    let value = uint_or(config, "pins", key, u64::from(default))?;
    u8::try_from(value).with_context(|| format!("[pins] {} = {} is not a valid BCM pin", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = FurnaceConfig::load(Path::new("/nonexistent/furnace.cfg")).unwrap();
        assert_eq!(config.controller.tick_ms, 500);
        assert_eq!(config.pins.heater, 17);
        assert!(!config.pid.autotune);
    }

    #[test]
    fn tick_period_is_clamped_to_bounds() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[controller]\ntick_ms = 50").unwrap();
        let config = FurnaceConfig::load(file.path()).unwrap();
        assert_eq!(config.controller.tick_ms, TICK_MS_MIN);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[controller]\ntick_ms = 10000").unwrap();
        let config = FurnaceConfig::load(file.path()).unwrap();
        assert_eq!(config.controller.tick_ms, TICK_MS_MAX);
    }

    #[test]
    fn pins_and_gains_are_read() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[pins]\nheater = 5\ndoor = 6\n\n[pid]\nkp = 4.0\nautotune = true"
        )
        .unwrap();
        let config = FurnaceConfig::load(file.path()).unwrap();
        assert_eq!(config.pins.heater, 5);
        assert_eq!(config.pins.door, 6);
        // Unmentioned pins keep their defaults.
        assert_eq!(config.pins.emergency, 25);
        assert_eq!(config.pid.kp, 4.0);
        assert!(config.pid.autotune);
    }
}
