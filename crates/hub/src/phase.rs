//! Growth phases and the cultivation calendar.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::warn;

use crate::error::ControlError;

/// Cultivation stage.  "No phase" is `Option::None` at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrowthPhase {
    #[serde(rename = "piantina")]
    Seedling,
    #[serde(rename = "vegetativa")]
    Vegetative,
    #[serde(rename = "fioritura")]
    Flowering,
}

impl GrowthPhase {
    /// Name stored in the config store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seedling => "piantina",
            Self::Vegetative => "vegetativa",
            Self::Flowering => "fioritura",
        }
    }
}

impl fmt::Display for GrowthPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrowthPhase {
    type Err = String;

    /// Accepts the stored names and their English equivalents, any case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "piantina" | "seedling" => Ok(Self::Seedling),
            "vegetativa" | "vegetative" => Ok(Self::Vegetative),
            "fioritura" | "flowering" => Ok(Self::Flowering),
            other => Err(format!("unknown growth phase '{other}'")),
        }
    }
}

/// Cultivation calendar for one sensor.  Dates are kept exactly as persisted
/// (RFC 3339 text) so a corrupt value surfaces at parse time, not load time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CultivationCycle {
    pub active: bool,
    pub cultivation_start: Option<String>,
    pub vegetative_start: Option<String>,
    pub flowering_start: Option<String>,
}

impl CultivationCycle {
    /// Date vegetative targets are aged from: the vegetative start, else the
    /// cultivation start.  `Ok(None)` when neither is recorded.
    pub fn vegetative_reference(&self) -> Result<Option<OffsetDateTime>, ControlError> {
        if let Some(raw) = &self.vegetative_start {
            return parse_timestamp("vegetative_start", raw).map(Some);
        }
        if let Some(raw) = &self.cultivation_start {
            return parse_timestamp("cultivation_start", raw).map(Some);
        }
        Ok(None)
    }

    /// Whole weeks since [`vegetative_reference`](Self::vegetative_reference).
    /// Missing or malformed dates count as "now", i.e. zero weeks.
    pub fn weeks_elapsed(&self, now: OffsetDateTime) -> u32 {
        let reference = match self.vegetative_reference() {
            Ok(r) => r.unwrap_or(now),
            Err(e) => {
                warn!("{e}; aging targets from now");
                now
            }
        };
        weeks_between(reference, now)
    }
}

/// `floor(days / 7)`, zero when `from` lies in the future.
pub fn weeks_between(from: OffsetDateTime, to: OffsetDateTime) -> u32 {
    let days = (to - from).whole_days();
    u32::try_from(days / 7).unwrap_or(0)
}

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    // Rfc3339 only fails for years outside 0..=9999.
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

pub fn parse_timestamp(field: &'static str, raw: &str) -> Result<OffsetDateTime, ControlError> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339).map_err(|_| ControlError::MalformedStartDate {
        field,
        value: raw.to_string(),
    })
}
