use std::{fmt, fs, path::Path, str::FromStr};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const DEFAULT_SYSFS_ROOT: &str = "/sys/class/gpio";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    pub path: String,
    pub timeout: u64,
}

/// Edge mode written to a line's `edge` attribute, and the filter applied to
/// callbacks registered on it.
#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Edge {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

impl Edge {
    pub fn as_str(self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }

    /// Whether a callback with this filter runs when the line now reads `level`.
    pub fn admits(self, level: Level) -> bool {
        match self {
            Edge::None => false,
            Edge::Rising => level == Level::High,
            Edge::Falling => level == Level::Low,
            Edge::Both => true,
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Edge {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Edge::None),
            "rising" => Ok(Edge::Rising),
            "falling" => Ok(Edge::Falling),
            "both" => Ok(Edge::Both),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(other.to_string()),
        }
    }
}

/// Logic level of a line as reported by its `value` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Low,
    High,
}

impl Level {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'0' => Some(Level::Low),
            b'1' => Some(Level::High),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Level::Low => b'0',
            Level::High => b'1',
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }

    /// The edge that ends at this level.
    pub fn edge(self) -> Edge {
        match self {
            Level::Low => Edge::Falling,
            Level::High => Edge::Rising,
        }
    }
}

impl Serialize for Level {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Level {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Level::Low),
            1 => Ok(Level::High),
            other => Err(serde::de::Error::custom(format!(
                "level must be 0 or 1, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LineConfig {
    pub name: String,
    #[serde(default)]
    pub edge: Edge,
}

fn default_sysfs_root() -> String {
    DEFAULT_SYSFS_ROOT.to_string()
}

fn default_broadcast_capacity() -> usize {
    64
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub http: HttpConfig,
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: String,
    pub lines: FxHashMap<u32, LineConfig>,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        serde_json::from_str(&contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))
    }
}
