//! Logging setup.
//!
//! Levels are a bitmask so intermediate combinations such as
//! `FATAL | WARN` are legal. Named presets cover the usual cases.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::Level;
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::error::EchowireError;

/// Target used for fatal-class events.
pub const FATAL_TARGET: &str = "echowire::fatal";

/// Bitmask of enabled log classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogLevel(u8);

impl LogLevel {
    pub const FATAL: u8 = 1;
    pub const ERROR: u8 = 2;
    pub const WARN: u8 = 4;
    pub const INFO: u8 = 8;
    pub const DEBUG: u8 = 16;

    pub const OFF: LogLevel = LogLevel(0);
    pub const FATAL_ONLY: LogLevel = LogLevel(1);
    pub const ERRORS: LogLevel = LogLevel(3);
    pub const WARNINGS: LogLevel = LogLevel(7);
    pub const INFOS: LogLevel = LogLevel(15);
    pub const ALL: LogLevel = LogLevel(31);

    /// Build from a raw mask. Bits above `DEBUG` are dropped.
    pub const fn from_mask(mask: u8) -> Self {
        Self(mask & 31)
    }

    /// Raw mask.
    pub const fn mask(self) -> u8 {
        self.0
    }

    /// Whether every bit of `class` is enabled.
    pub const fn contains(self, class: u8) -> bool {
        self.0 & class == class && class != 0
    }

    /// Whether an event with `level` and `target` passes this mask.
    pub fn enabled(self, level: &Level, target: &str) -> bool {
        if target == FATAL_TARGET {
            return self.contains(Self::FATAL);
        }
        let class = match *level {
            Level::ERROR => Self::ERROR,
            Level::WARN => Self::WARN,
            Level::INFO => Self::INFO,
            Level::DEBUG | Level::TRACE => Self::DEBUG,
        };
        self.contains(class)
    }

    fn preset_name(self) -> Option<&'static str> {
        match self.0 {
            0 => Some("off"),
            1 => Some("fatal"),
            3 => Some("error"),
            7 => Some("warn"),
            15 => Some("info"),
            31 => Some("all"),
            _ => None,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::INFOS
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.preset_name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl FromStr for LogLevel {
    type Err = EchowireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(Self::OFF),
            "fatal" => Ok(Self::FATAL_ONLY),
            "error" => Ok(Self::ERRORS),
            "warn" => Ok(Self::WARNINGS),
            "info" => Ok(Self::INFOS),
            "all" | "debug" => Ok(Self::ALL),
            other => other
                .parse::<u8>()
                .ok()
                .filter(|m| *m <= 31)
                .map(Self::from_mask)
                .ok_or_else(|| EchowireError::Config(format!("unknown log level \"{s}\""))),
        }
    }
}

impl Serialize for LogLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.preset_name() {
            Some(name) => serializer.serialize_str(name),
            None => serializer.serialize_u8(self.0),
        }
    }
}

impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Mask(u8),
            Name(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Mask(mask) if mask <= 31 => Ok(Self::from_mask(mask)),
            Raw::Mask(mask) => Err(serde::de::Error::custom(format!(
                "log level mask {mask} out of range"
            ))),
            Raw::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Install the global fmt subscriber.
///
/// `RUST_LOG`, when set, takes precedence over `level`. Calling this again
/// after a subscriber is installed does nothing.
pub fn init(level: LogLevel) {
    let fmt = tracing_subscriber::fmt::layer().with_target(true);

    let installed = match EnvFilter::try_from_default_env() {
        Ok(env) => tracing_subscriber::registry()
            .with(fmt.with_filter(env))
            .try_init(),
        Err(_) => tracing_subscriber::registry()
            .with(fmt.with_filter(filter_fn(move |meta| {
                level.enabled(meta.level(), meta.target())
            })))
            .try_init(),
    };

    if installed.is_ok() {
        tracing::debug!("logging initialised at level {}", level);
    }
}
