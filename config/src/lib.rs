// SPDX-License-Identifier: MPL-2.0

use cosmic_config::{Config as CosmicConfig, ConfigGet, ConfigSet};
use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

pub const NAME: &str = "io.github.LiveBg";

/// Index of outputs that have a stored assignment.
pub const ASSIGNMENTS: &str = "assignments";
pub const POWER_SAVE: &str = "power-save";
pub const PAUSE_ON_MAXIMIZED: &str = "pause-on-maximized";
pub const FRAME_RATE_CAP: &str = "frame-rate-cap";
pub const OCCLUSION_DEBOUNCE_MS: &str = "occlusion-debounce-ms";
pub const POWER_POLL_MS: &str = "power-poll-ms";

/// Prefix of the per-output assignment keys.
pub const OUTPUT_PREFIX: &str = "output.";

/// Wallpapers start silent.
pub const DEFAULT_VOLUME: u8 = 0;
pub const MAX_VOLUME: u8 = 100;

/// Playback rate bounds. Rates above [`SAFE_MAX_SPEED`] are refused by some
/// decoders, in which case playback falls back to it.
pub const DEFAULT_SPEED: f64 = 1.0;
pub const MIN_SPEED: f64 = 0.25;
pub const SAFE_MAX_SPEED: f64 = 2.0;
pub const MAX_SPEED: f64 = 2.5;

const MIN_POWER_POLL_MS: u64 = 500;
const MAX_POWER_POLL_MS: u64 = 5000;

#[must_use]
pub fn output_key(output: &str) -> String {
    format!("{OUTPUT_PREFIX}{output}")
}

/// Clamp a user supplied volume into the 0-100 range.
#[must_use]
pub fn clamp_volume(volume: i64) -> u8 {
    volume.clamp(0, i64::from(MAX_VOLUME)) as u8
}

/// Clamp a user supplied playback rate into `MIN_SPEED..=MAX_SPEED`.
///
/// Values that are not a number play at normal speed.
#[must_use]
pub fn clamp_speed(speed: f64) -> f64 {
    if speed.is_nan() {
        return DEFAULT_SPEED;
    }
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

fn default_volume() -> u8 {
    DEFAULT_VOLUME
}

fn default_speed() -> f64 {
    DEFAULT_SPEED
}

fn clamped_volume<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    i64::deserialize(deserializer).map(clamp_volume)
}

fn clamped_speed<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    f64::deserialize(deserializer).map(clamp_speed)
}

fn default_enabled() -> bool {
    true
}

/// A stored binding of one output to one video source.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Setters)]
#[serde(deny_unknown_fields)]
#[must_use]
pub struct Assignment {
    /// connector name of the output
    #[setters(skip)]
    pub output: String,
    /// path of the video played on the output
    #[setters(skip)]
    pub source: PathBuf,
    /// playback volume, 0-100
    #[serde(default = "default_volume", deserialize_with = "clamped_volume")]
    pub volume: u8,
    #[serde(default)]
    pub muted: bool,
    /// playback rate, 0.25-2.5
    #[serde(default = "default_speed", deserialize_with = "clamped_speed")]
    pub speed: f64,
    /// disabled entries are kept in the store but never played
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Assignment {
    pub fn new(output: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            output: output.into(),
            source: source.into(),
            volume: DEFAULT_VOLUME,
            muted: false,
            speed: DEFAULT_SPEED,
            enabled: true,
        }
    }

    #[must_use]
    pub fn key(&self) -> String {
        output_key(&self.output)
    }
}

/// Engine-wide behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Settings {
    /// pause every output while running on battery
    pub power_save: bool,
    /// pause an output while a maximized or fullscreen window covers it
    pub pause_on_maximized: bool,
    /// optional frames-per-second cap for every session
    pub frame_rate_cap: Option<u32>,
    pub occlusion_debounce_ms: u64,
    pub power_poll_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            power_save: true,
            pause_on_maximized: true,
            frame_rate_cap: None,
            occlusion_debounce_ms: 400,
            power_poll_ms: 3000,
        }
    }
}

impl Settings {
    /// Read every settings key, keeping the default for keys that are missing or invalid.
    pub fn load(context: &CosmicConfig) -> Self {
        let defaults = Self::default();

        Self {
            power_save: get_or(context, POWER_SAVE, defaults.power_save),
            pause_on_maximized: get_or(context, PAUSE_ON_MAXIMIZED, defaults.pause_on_maximized),
            frame_rate_cap: get_or(context, FRAME_RATE_CAP, defaults.frame_rate_cap),
            occlusion_debounce_ms: get_or(
                context,
                OCCLUSION_DEBOUNCE_MS,
                defaults.occlusion_debounce_ms,
            ),
            power_poll_ms: get_or(context, POWER_POLL_MS, defaults.power_poll_ms),
        }
    }

    #[must_use]
    pub fn occlusion_debounce(&self) -> Duration {
        Duration::from_millis(self.occlusion_debounce_ms)
    }

    /// Battery polling interval, bounded so AC changes show up within five seconds.
    #[must_use]
    pub fn power_poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.power_poll_ms
                .clamp(MIN_POWER_POLL_MS, MAX_POWER_POLL_MS),
        )
    }

    /// Persist the power-save switch.
    ///
    /// # Errors
    ///
    /// Fails if the value could not be written to cosmic-config.
    pub fn set_power_save(
        &mut self,
        context: &CosmicConfig,
        enabled: bool,
    ) -> Result<(), cosmic_config::Error> {
        context.set(POWER_SAVE, enabled)?;
        self.power_save = enabled;
        Ok(())
    }
}

fn get_or<T>(context: &CosmicConfig, key: &str, default: T) -> T
where
    T: serde::de::DeserializeOwned + std::fmt::Debug,
{
    match context.get::<T>(key) {
        Ok(value) => value,
        Err(why) => {
            tracing::debug!(key, ?why, ?default, "using default setting");
            default
        }
    }
}

#[must_use]
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Config {
    pub settings: Settings,
    pub assignments: Vec<Assignment>,
}

impl Config {
    /// Convenience function for cosmic-config
    ///
    /// # Errors
    ///
    /// Fails if cosmic-config paths are missing or cannot be created.
    pub fn helper() -> Result<CosmicConfig, cosmic_config::Error> {
        CosmicConfig::new(NAME, 1)
    }

    /// Load settings and all enabled assignments from cosmic-config.
    ///
    /// A missing assignment index is treated as an empty table.
    pub fn load(context: &CosmicConfig) -> Self {
        let outputs = Self::load_outputs(context).unwrap_or_else(|why| {
            tracing::debug!(?why, "no stored assignments");
            Vec::new()
        });

        let assignments = outputs
            .iter()
            .filter_map(|output| match Self::load_entry(context, output) {
                Ok(entry) => Some(entry),
                Err(why) => {
                    tracing::warn!(output, ?why, "skipping unreadable assignment");
                    None
                }
            })
            .filter(|entry| entry.enabled)
            .collect();

        Self {
            settings: Settings::load(context),
            assignments,
        }
    }

    /// Get the assignment for a given output.
    #[must_use]
    pub fn assignment(&self, output: &str) -> Option<&Assignment> {
        self.assignments
            .iter()
            .find(|entry| entry.output == output)
    }

    /// Write an assignment through to cosmic-config and update the in-memory table.
    ///
    /// # Errors
    ///
    /// Fails if the entry could not be set in cosmic-config.
    pub fn set_assignment(
        &mut self,
        context: &CosmicConfig,
        entry: Assignment,
    ) -> Result<(), cosmic_config::Error> {
        context.set(&entry.key(), entry.clone())?;

        if let Some(old) = self
            .assignments
            .iter_mut()
            .find(|old| old.output == entry.output)
        {
            *old = entry;
        } else {
            self.assignments.push(entry);
        }

        self.store_index(context)
    }

    /// Disable the stored entry for an output and drop it from the index.
    ///
    /// # Errors
    ///
    /// Fails if cosmic-config could not be updated.
    pub fn disable_assignment(
        &mut self,
        context: &CosmicConfig,
        output: &str,
    ) -> Result<(), cosmic_config::Error> {
        if let Ok(entry) = Self::load_entry(context, output) {
            context.set(&entry.key(), entry.enabled(false))?;
        }

        self.assignments.retain(|entry| entry.output != output);
        self.store_index(context)
    }

    fn store_index(&self, context: &CosmicConfig) -> Result<(), cosmic_config::Error> {
        let mut outputs: Vec<&str> = self
            .assignments
            .iter()
            .map(|entry| entry.output.as_str())
            .collect();
        outputs.sort_unstable();
        context.set(ASSIGNMENTS, outputs)
    }

    /// Get the stored entry for an output from cosmic-config.
    ///
    /// # Errors
    ///
    /// Fails if the entry is missing or fails to parse.
    pub fn load_entry(
        context: &CosmicConfig,
        output: &str,
    ) -> Result<Assignment, cosmic_config::Error> {
        context.get::<Assignment>(&output_key(output))
    }

    /// Get all indexed outputs from cosmic-config.
    ///
    /// # Errors
    ///
    /// Fails if the index is missing or fails to parse.
    pub fn load_outputs(context: &CosmicConfig) -> Result<Vec<String>, cosmic_config::Error> {
        context.get::<Vec<String>>(ASSIGNMENTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_key() {
        assert_eq!(output_key("HDMI-A-1"), "output.HDMI-A-1");
        assert_eq!(Assignment::new("DP-2", "/v.mp4").key(), "output.DP-2");
    }

    #[test]
    fn test_clamp_volume() {
        assert_eq!(clamp_volume(-5), 0);
        assert_eq!(clamp_volume(42), 42);
        assert_eq!(clamp_volume(250), 100);
    }

    #[test]
    fn test_clamp_speed() {
        assert_eq!(clamp_speed(0.1), MIN_SPEED);
        assert_eq!(clamp_speed(1.5), 1.5);
        assert_eq!(clamp_speed(4.0), MAX_SPEED);
        assert_eq!(clamp_speed(f64::NEG_INFINITY), MIN_SPEED);
        assert_eq!(clamp_speed(f64::NAN), DEFAULT_SPEED);
    }

    #[test]
    fn test_entry_defaults_when_fields_missing() {
        let entry: Assignment =
            ron::from_str(r#"(output: "eDP-1", source: "/videos/rain.webm")"#).unwrap();
        assert_eq!(entry.volume, DEFAULT_VOLUME);
        assert_eq!(entry.speed, DEFAULT_SPEED);
        assert!(!entry.muted);
        assert!(entry.enabled);
    }

    #[test]
    fn test_stored_values_are_clamped_on_load() {
        let entry: Assignment = ron::from_str(
            r#"(output: "eDP-1", source: "/v.mp4", volume: 250, speed: 9.0)"#,
        )
        .unwrap();
        assert_eq!(entry.volume, MAX_VOLUME);
        assert_eq!(entry.speed, MAX_SPEED);

        let entry: Assignment =
            ron::from_str(r#"(output: "eDP-1", source: "/v.mp4", volume: -3, speed: 0.0)"#)
                .unwrap();
        assert_eq!(entry.volume, 0);
        assert_eq!(entry.speed, MIN_SPEED);
    }

    #[test]
    fn test_entry_rejects_unknown_fields() {
        let parsed = ron::from_str::<Assignment>(
            r#"(output: "eDP-1", source: "/v.mp4", repeat: false)"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_power_poll_interval_is_bounded() {
        let mut settings = Settings::default();
        settings.power_poll_ms = 60_000;
        assert_eq!(settings.power_poll_interval(), Duration::from_secs(5));
        settings.power_poll_ms = 10;
        assert_eq!(settings.power_poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_setters_keep_identity() {
        let entry = Assignment::new("DP-1", "/v.mp4").volume(30).muted(true).speed(1.5);
        assert_eq!(entry.output, "DP-1");
        assert_eq!(entry.volume, 30);
        assert_eq!(entry.speed, 1.5);
        assert!(entry.muted);
    }
}
