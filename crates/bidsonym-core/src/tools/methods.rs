//! Closed sets of brain-extraction and defacing methods.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Brain-extraction (skull-stripping) method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrainExtractionMethod {
    /// FSL BET. Requires a fractional intensity threshold.
    Bet,
    /// Deep-learning mask prediction.
    Nobrainer,
}

impl BrainExtractionMethod {
    pub const ALL: [BrainExtractionMethod; 2] =
        [BrainExtractionMethod::Bet, BrainExtractionMethod::Nobrainer];

    pub fn as_str(&self) -> &'static str {
        match self {
            BrainExtractionMethod::Bet => "bet",
            BrainExtractionMethod::Nobrainer => "nobrainer",
        }
    }

    /// Whether this method needs `--bet-frac`.
    pub fn requires_frac(&self) -> bool {
        matches!(self, BrainExtractionMethod::Bet)
    }
}

impl fmt::Display for BrainExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrainExtractionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown brain extraction method '{s}' (expected bet or nobrainer)"))
    }
}

/// De-identification (face removal) method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeidMethod {
    Pydeface,
    MriDeface,
    Quickshear,
    Mridefacer,
    Deepdefacer,
}

impl DeidMethod {
    pub const ALL: [DeidMethod; 5] = [
        DeidMethod::Pydeface,
        DeidMethod::MriDeface,
        DeidMethod::Quickshear,
        DeidMethod::Mridefacer,
        DeidMethod::Deepdefacer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeidMethod::Pydeface => "pydeface",
            DeidMethod::MriDeface => "mri_deface",
            DeidMethod::Quickshear => "quickshear",
            DeidMethod::Mridefacer => "mridefacer",
            DeidMethod::Deepdefacer => "deepdefacer",
        }
    }
}

impl fmt::Display for DeidMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeidMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|m| m.as_str() == s).ok_or_else(|| {
            let known: Vec<&str> = Self::ALL.iter().map(|m| m.as_str()).collect();
            format!("unknown deid method '{s}' (expected one of: {})", known.join(", "))
        })
    }
}
