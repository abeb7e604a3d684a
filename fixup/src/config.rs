//! Configuration snapshot read from boot arguments and device properties.
//!
//! The snapshot is cheap to build and side-effect free, so it is re-read on
//! every start/probe call instead of being cached.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::TARGET_COUNT;

pub const KEY_DRIVER: &str = "brcmfx-driver";
pub const KEY_COUNTRY: &str = "brcmfx-country";
pub const KEY_ASPM: &str = "brcmfx-aspm";
pub const KEY_DELAY: &str = "brcmfx-delay";
pub const KEY_WOWL: &str = "brcmfx-wowl";
pub const KEY_DEBUG: &str = "brcmfx-dbg";
pub const KEY_OFF: &str = "brcmfx-off";

pub const DEFAULT_COUNTRY: &str = "US";

/// Longest country code the drivers accept (`"#a"` is the worldwide code).
const MAX_COUNTRY_LEN: usize = 3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid number for {key}: {value:?}")]
    InvalidNumber { key: String, value: String },

    #[error("driver index {0} is not a known target")]
    DriverOutOfRange(usize),

    #[error("invalid country code {0:?}")]
    InvalidCountry(String),

    #[error("invalid ASPM state {0} (expected 0..=3)")]
    InvalidAspm(u32),
}

/// Which driver family is allowed to attach.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverSelection {
    /// Every family except the manufacturing build.
    #[default]
    Auto,
    /// Exactly one family, by catalog index.
    Pinned(usize),
}

/// PCIe link power state applied to the wireless provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum AspmState {
    #[default]
    Disabled = 0,
    L0s = 1,
    L1 = 2,
    L0sL1 = 3,
}

impl TryFrom<u32> for AspmState {
    type Error = ConfigError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(AspmState::Disabled),
            1 => Ok(AspmState::L0s),
            2 => Ok(AspmState::L1),
            3 => Ok(AspmState::L0sL1),
            other => Err(ConfigError::InvalidAspm(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Disable every patch (`-brcmfxoff`).
    pub off: bool,
    /// Verbose logging (`-brcmfxdbg`).
    pub debug: bool,
    pub driver: DriverSelection,
    pub country_code: String,
    pub override_aspm: bool,
    pub aspm: AspmState,
    pub wake_on_wireless: bool,
    pub start_delay_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            off: false,
            debug: false,
            driver: DriverSelection::Auto,
            country_code: DEFAULT_COUNTRY.to_string(),
            override_aspm: false,
            aspm: AspmState::Disabled,
            wake_on_wireless: false,
            start_delay_ms: 0,
        }
    }
}

/// A key/value configuration source.
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Boolean switch; a present key counts as set unless its value is `0`/`false`.
    fn flag(&self, key: &str) -> bool {
        self.get(key)
            .is_some_and(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
    }
}

impl Config {
    /// Build a snapshot from `sources`, later sources overriding earlier ones.
    ///
    /// Invalid values are logged and ignored; reading never fails.
    pub fn from_sources(sources: &[&dyn ConfigSource]) -> Self {
        let mut config = Config::default();
        for source in sources {
            config.apply(*source);
        }
        config
    }

    fn apply(&mut self, source: &dyn ConfigSource) {
        if source.get(KEY_OFF).is_some() {
            self.off = source.flag(KEY_OFF);
        }
        if source.get(KEY_DEBUG).is_some() {
            self.debug = source.flag(KEY_DEBUG);
        }
        if source.get(KEY_WOWL).is_some() {
            self.wake_on_wireless = source.flag(KEY_WOWL);
        }

        if let Some(raw) = source.get(KEY_DRIVER) {
            match parse_driver(&raw) {
                Ok(driver) => self.driver = driver,
                Err(e) => warn!("ignoring {}: {}", KEY_DRIVER, e),
            }
        }
        if let Some(raw) = source.get(KEY_COUNTRY) {
            match parse_country(&raw) {
                Ok(code) => self.country_code = code,
                Err(e) => warn!("ignoring {}: {}", KEY_COUNTRY, e),
            }
        }
        if let Some(raw) = source.get(KEY_ASPM) {
            match parse_number(KEY_ASPM, &raw).and_then(AspmState::try_from) {
                Ok(state) => {
                    self.override_aspm = true;
                    self.aspm = state;
                }
                Err(e) => warn!("ignoring {}: {}", KEY_ASPM, e),
            }
        }
        if let Some(raw) = source.get(KEY_DELAY) {
            match parse_number(KEY_DELAY, &raw) {
                Ok(ms) => self.start_delay_ms = ms,
                Err(e) => warn!("ignoring {}: {}", KEY_DELAY, e),
            }
        }
    }

    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(u64::from(self.start_delay_ms))
    }
}

fn parse_number(key: &str, raw: &str) -> Result<u32, ConfigError> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|_| ConfigError::InvalidNumber {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn parse_driver(raw: &str) -> Result<DriverSelection, ConfigError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("auto") || raw == "-1" {
        return Ok(DriverSelection::Auto);
    }
    let index = parse_number(KEY_DRIVER, raw)? as usize;
    if index >= TARGET_COUNT {
        return Err(ConfigError::DriverOutOfRange(index));
    }
    Ok(DriverSelection::Pinned(index))
}

fn parse_country(raw: &str) -> Result<String, ConfigError> {
    let code = raw.trim_end_matches('\0').trim();
    let valid = !code.is_empty()
        && code.len() <= MAX_COUNTRY_LEN
        && code.bytes().all(|b| b.is_ascii_graphic());
    if valid {
        Ok(code.to_string())
    } else {
        Err(ConfigError::InvalidCountry(raw.to_string()))
    }
}

/// Kernel boot arguments, e.g. `-v -brcmfxdbg brcmfx-country=#a`.
///
/// Switches are spelled without the inner dash: `-brcmfxwowl` sets
/// `brcmfx-wowl`.
#[derive(Debug, Clone, Default)]
pub struct BootArgs {
    tokens: Vec<String>,
}

impl BootArgs {
    pub fn parse(command_line: &str) -> Self {
        Self {
            tokens: command_line.split_whitespace().map(str::to_string).collect(),
        }
    }
}

impl ConfigSource for BootArgs {
    fn get(&self, key: &str) -> Option<String> {
        let switch = format!("-{}", key.replace('-', ""));
        // Last occurrence wins, like the kernel's own argument parser.
        self.tokens.iter().rev().find_map(|token| {
            if *token == switch {
                return Some("1".to_string());
            }
            token
                .strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
                .map(str::to_string)
        })
    }
}

/// Properties injected on the wireless provider's registry entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceProperties {
    values: BTreeMap<String, serde_json::Value>,
}

impl DeviceProperties {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse device properties")
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }
}

impl ConfigSource for DeviceProperties {
    fn get(&self, key: &str) -> Option<String> {
        use serde_json::Value;
        match self.values.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            // Registry data blobs arrive as byte arrays.
            Value::Array(bytes) => {
                let bytes: Vec<u8> = bytes
                    .iter()
                    .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect::<Option<_>>()?;
                Some(decode_blob(key, &bytes))
            }
            Value::Null | Value::Object(_) => None,
        }
    }
}

/// Numeric keys carry little-endian integers of 1, 2 or 4 bytes; everything
/// else is text, possibly null-terminated.
fn decode_blob(key: &str, bytes: &[u8]) -> String {
    if key != KEY_COUNTRY && matches!(bytes.len(), 1 | 2 | 4) {
        let mut word = [0u8; 4];
        word[..bytes.len()].copy_from_slice(bytes);
        return u32::from_le_bytes(word).to_string();
    }
    String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()
}
