use crate::error::{PortError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A contiguous, inclusive range of TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn parse(range_str: &str) -> Result<Self> {
        let invalid = || PortError::InvalidRange(range_str.to_string());

        let (start, end) = range_str.trim().split_once('-').ok_or_else(invalid)?;
        let start: u16 = start.trim().parse().map_err(|_| invalid())?;
        let end: u16 = end.trim().parse().map_err(|_| invalid())?;

        Self::new(start, end).map_err(|_| invalid())
    }

    pub fn new(start: u16, end: u16) -> Result<Self> {
        if start == 0 || start > end {
            return Err(PortError::InvalidRange(format!("{}-{}", start, end)));
        }
        Ok(PortRange { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn overlaps_with(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    pub fn size(&self) -> u32 {
        u32::from(self.end) - u32::from(self.start) + 1
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PortRange {
    type Error = PortError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}
