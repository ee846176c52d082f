// src/serial/line.rs
//! Serial line settings

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Baud rate, either fixed or detected at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "BaudRateRepr", into = "BaudRateRepr")]
pub enum BaudRate {
    Auto,
    Fixed(u32),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum BaudRateRepr {
    Rate(u32),
    Name(String),
}

impl TryFrom<BaudRateRepr> for BaudRate {
    type Error = String;

    fn try_from(repr: BaudRateRepr) -> Result<Self, Self::Error> {
        match repr {
            BaudRateRepr::Rate(0) => Err("baud rate must be positive".to_string()),
            BaudRateRepr::Rate(rate) => Ok(Self::Fixed(rate)),
            BaudRateRepr::Name(name) => name.parse(),
        }
    }
}

impl From<BaudRate> for BaudRateRepr {
    fn from(rate: BaudRate) -> Self {
        match rate {
            BaudRate::Auto => Self::Name("auto".to_string()),
            BaudRate::Fixed(rate) => Self::Rate(rate),
        }
    }
}

impl FromStr for BaudRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        match s.parse::<u32>() {
            Ok(rate) if rate > 0 => Ok(Self::Fixed(rate)),
            _ => Err(format!("invalid baud rate '{}', expected a number or 'auto'", s)),
        }
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Fixed(rate) => write!(f, "{}", rate),
        }
    }
}

/// Number of data bits per character, 5 to 9
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DataBits(u8);

impl DataBits {
    pub const EIGHT: Self = Self(8);

    pub fn new(bits: u8) -> Option<Self> {
        (5..=9).contains(&bits).then_some(Self(bits))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for DataBits {
    fn default() -> Self {
        Self::EIGHT
    }
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        Self::new(bits).ok_or_else(|| format!("invalid data bits {}, expected 5 to 9", bits))
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> u8 {
        bits.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Parity {
    fn letter(self) -> char {
        match self {
            Self::None => 'N',
            Self::Odd => 'O',
            Self::Even => 'E',
            Self::Mark => 'M',
            Self::Space => 'S',
        }
    }
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            "mark" | "m" => Ok(Self::Mark),
            "space" | "s" => Ok(Self::Space),
            _ => Err(format!("invalid parity '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopBits {
    #[default]
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

impl FromStr for StopBits {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" => Ok(Self::One),
            "1.5" => Ok(Self::OnePointFive),
            "2" => Ok(Self::Two),
            _ => Err(format!("invalid stop bits '{}', expected 1, 1.5 or 2", s)),
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::One => "1",
            Self::OnePointFive => "1.5",
            Self::Two => "2",
        })
    }
}

/// Immutable serial line settings snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialLineConfiguration {
    pub baud_rate: BaudRate,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for SerialLineConfiguration {
    fn default() -> Self {
        Self::new(BaudRate::Fixed(9600))
    }
}

impl SerialLineConfiguration {
    /// 8N1 at the given rate
    pub fn new(baud_rate: BaudRate) -> Self {
        Self {
            baud_rate,
            data_bits: DataBits::EIGHT,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }

    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: BaudRate) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    #[must_use]
    pub fn with_data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    #[must_use]
    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    pub fn is_auto_baud(&self) -> bool {
        self.baud_rate == BaudRate::Auto
    }
}

impl fmt::Display for SerialLineConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate,
            self.data_bits.get(),
            self.parity.letter(),
            self.stop_bits
        )
    }
}
