//! Dotted platform release versions (`9.0.0.cl-94`, `10.1.0`, `8.4.1-sw`).
//!
//! Only the leading numeric components take part in comparisons; missing
//! trailing components compare as zero, so `9.0` == `9.0.0`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::document::DocumentError;

#[derive(Debug, Clone, Eq)]
pub struct PlatformVersion {
    parts: Vec<u32>,
}

impl PlatformVersion {
    pub fn new(parts: &[u32]) -> Self {
        Self {
            parts: parts.to_vec(),
        }
    }

    /// True when `self` is the same release as `threshold` or newer.
    pub fn at_least(&self, threshold: &PlatformVersion) -> bool {
        self >= threshold
    }

    fn component(&self, i: usize) -> u32 {
        self.parts.get(i).copied().unwrap_or(0)
    }
}

impl FromStr for PlatformVersion {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = Vec::new();
        for piece in s.trim().trim_start_matches(['v', 'V']).split('.') {
            let digits: String = piece.chars().take_while(char::is_ascii_digit).collect();
            if digits.is_empty() {
                break;
            }
            let n = digits
                .parse::<u32>()
                .map_err(|_| DocumentError::InvalidVersion(s.to_string()))?;
            parts.push(n);
            if digits.len() != piece.len() {
                break;
            }
        }
        if parts.is_empty() {
            return Err(DocumentError::InvalidVersion(s.to_string()));
        }
        Ok(Self { parts })
    }
}

impl Ord for PlatformVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for PlatformVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PlatformVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl fmt::Display for PlatformVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.parts.iter().map(u32::to_string).collect();
        f.write_str(&rendered.join("."))
    }
}
