use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MIN_SLEEP_LATENCY_MIN: u32 = 0;
pub const MAX_SLEEP_LATENCY_MIN: u32 = 60;
pub const MIN_CYCLE_LENGTH_MIN: u32 = 60;
pub const MAX_CYCLE_LENGTH_MIN: u32 = 110;
pub const MIN_CYCLES: u32 = 1;
pub const MAX_CYCLES: u32 = 10;

pub const DEFAULT_SLEEP_LATENCY_MIN: u32 = 15;
pub const DEFAULT_CYCLE_LENGTH_MIN: u32 = 90;
pub const DEFAULT_MIN_CYCLES: u32 = 4;
pub const DEFAULT_MAX_CYCLES: u32 = 6;

/// Why a calculation request was rejected before any work happened.
///
/// Messages name the offending field so they can be surfaced to the user
/// verbatim, both by the CLI and in the API's `detail` payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("wake_time is required")]
    WakeTimeMissing,
    #[error("wake_time must be in HH:MM format (24-hour), got '{0}'")]
    WakeTimeFormat(String),
    #[error("sleep_latency_min must be between 0 and 60 minutes, got {0}")]
    SleepLatency(u32),
    #[error("cycle_length_min must be between 60 and 110 minutes, got {0}")]
    CycleLength(u32),
    #[error("min_cycles must be between 1 and 10, got {0}")]
    MinCycles(u32),
    #[error("max_cycles must be between 1 and 10, got {0}")]
    MaxCycles(u32),
    #[error("min_cycles ({min}) must be less than or equal to max_cycles ({max})")]
    CycleOrder { min: u32, max: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateRequest {
    pub wake_time: String,
    #[serde(default = "default_sleep_latency")]
    pub sleep_latency_min: u32,
    #[serde(default = "default_cycle_length")]
    pub cycle_length_min: u32,
    #[serde(default = "default_min_cycles")]
    pub min_cycles: u32,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
}

/// One candidate bedtime, produced per cycle count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepOption {
    pub cycles: u32,
    pub bedtime: String,
    pub total_sleep_hours: f64,
    pub total_sleep_minutes: u32,
    pub recommended: bool,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    pub sleep_latency_min: u32,
    pub cycle_length_min: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculateResponse {
    pub wake_time: String,
    pub options: Vec<SleepOption>,
    pub parameters: Parameters,
}

/// Server-side default parameters. Held in memory only; they reset when the
/// server restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default = "default_sleep_latency")]
    pub sleep_latency_min: u32,
    #[serde(default = "default_cycle_length")]
    pub cycle_length_min: u32,
    #[serde(default = "default_min_cycles")]
    pub min_cycles: u32,
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            sleep_latency_min: DEFAULT_SLEEP_LATENCY_MIN,
            cycle_length_min: DEFAULT_CYCLE_LENGTH_MIN,
            min_cycles: DEFAULT_MIN_CYCLES,
            max_cycles: DEFAULT_MAX_CYCLES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferencesSaved {
    pub message: String,
    pub preferences: Preferences,
}

/// Machine-readable failure reason carried by every non-2xx API response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub detail: String,
}

fn default_sleep_latency() -> u32 {
    DEFAULT_SLEEP_LATENCY_MIN
}

fn default_cycle_length() -> u32 {
    DEFAULT_CYCLE_LENGTH_MIN
}

fn default_min_cycles() -> u32 {
    DEFAULT_MIN_CYCLES
}

fn default_max_cycles() -> u32 {
    DEFAULT_MAX_CYCLES
}

/// Parses a clock time in HH:MM 24-hour form. Used for both wake times in
/// requests and bedtime strings coming back from the calculator.
pub fn parse_clock_time(input: &str) -> Result<NaiveTime, ValidationError> {
    let malformed = || ValidationError::WakeTimeFormat(input.to_string());
    let trimmed = input.trim();
    let Some((hours, minutes)) = trimmed.split_once(':') else {
        return Err(malformed());
    };
    let hour = hours.trim().parse::<u32>().map_err(|_| malformed())?;
    let minute = minutes.trim().parse::<u32>().map_err(|_| malformed())?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(malformed)
}

pub fn format_clock_time(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

/// Checks the four tunables shared by requests and preferences, in the same
/// order the request validator applies them.
pub fn validate_parameters(
    sleep_latency_min: u32,
    cycle_length_min: u32,
    min_cycles: u32,
    max_cycles: u32,
) -> Result<(), ValidationError> {
    if !(MIN_SLEEP_LATENCY_MIN..=MAX_SLEEP_LATENCY_MIN).contains(&sleep_latency_min) {
        return Err(ValidationError::SleepLatency(sleep_latency_min));
    }
    if !(MIN_CYCLE_LENGTH_MIN..=MAX_CYCLE_LENGTH_MIN).contains(&cycle_length_min) {
        return Err(ValidationError::CycleLength(cycle_length_min));
    }
    if !(MIN_CYCLES..=MAX_CYCLES).contains(&min_cycles) {
        return Err(ValidationError::MinCycles(min_cycles));
    }
    if !(MIN_CYCLES..=MAX_CYCLES).contains(&max_cycles) {
        return Err(ValidationError::MaxCycles(max_cycles));
    }
    if min_cycles > max_cycles {
        return Err(ValidationError::CycleOrder {
            min: min_cycles,
            max: max_cycles,
        });
    }
    Ok(())
}

/// Full request validation. Pure; short-circuits on the first failure and
/// returns the parsed wake time on success.
pub fn validate_request(request: &CalculateRequest) -> Result<NaiveTime, ValidationError> {
    if request.wake_time.trim().is_empty() {
        return Err(ValidationError::WakeTimeMissing);
    }
    let wake = parse_clock_time(&request.wake_time)?;
    validate_parameters(
        request.sleep_latency_min,
        request.cycle_length_min,
        request.min_cycles,
        request.max_cycles,
    )?;
    Ok(wake)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(
        wake_time: &str,
        latency: u32,
        cycle: u32,
        min_cycles: u32,
        max_cycles: u32,
    ) -> CalculateRequest {
        CalculateRequest {
            wake_time: wake_time.to_string(),
            sleep_latency_min: latency,
            cycle_length_min: cycle,
            min_cycles,
            max_cycles,
        }
    }

    #[test]
    fn accepts_valid_request() {
        let parsed = validate_request(&request("07:30", 15, 90, 4, 6)).expect("valid");
        assert_eq!(format_clock_time(parsed), "07:30");
    }

    #[test]
    fn normalizes_single_digit_hours() {
        let parsed = validate_request(&request("7:05", 15, 90, 4, 6)).expect("valid");
        assert_eq!(format_clock_time(parsed), "07:05");
    }

    #[test]
    fn rejects_empty_wake_time() {
        assert_eq!(
            validate_request(&request("  ", 15, 90, 4, 6)),
            Err(ValidationError::WakeTimeMissing)
        );
    }

    #[test]
    fn rejects_malformed_wake_time() {
        for bad in ["7h30", "25:00", "07:61", "seven", "07:"] {
            let err = validate_request(&request(bad, 15, 90, 4, 6)).expect_err(bad);
            assert!(err.to_string().contains("HH:MM"), "{bad}: {err}");
        }
    }

    #[test]
    fn latency_boundaries_are_inclusive() {
        assert!(validate_request(&request("07:30", 0, 90, 4, 6)).is_ok());
        assert!(validate_request(&request("07:30", 60, 90, 4, 6)).is_ok());
        assert_eq!(
            validate_request(&request("07:30", 61, 90, 4, 6)),
            Err(ValidationError::SleepLatency(61))
        );
    }

    #[test]
    fn cycle_length_boundaries_are_inclusive() {
        assert!(validate_request(&request("07:30", 15, 60, 4, 6)).is_ok());
        assert!(validate_request(&request("07:30", 15, 110, 4, 6)).is_ok());
        assert_eq!(
            validate_request(&request("07:30", 15, 59, 4, 6)),
            Err(ValidationError::CycleLength(59))
        );
        assert_eq!(
            validate_request(&request("07:30", 15, 111, 4, 6)),
            Err(ValidationError::CycleLength(111))
        );
    }

    #[test]
    fn cycle_count_boundaries_are_inclusive() {
        assert!(validate_request(&request("07:30", 15, 90, 1, 10)).is_ok());
        assert_eq!(
            validate_request(&request("07:30", 15, 90, 0, 6)),
            Err(ValidationError::MinCycles(0))
        );
        assert_eq!(
            validate_request(&request("07:30", 15, 90, 4, 11)),
            Err(ValidationError::MaxCycles(11))
        );
    }

    #[test]
    fn equal_min_and_max_cycles_is_valid() {
        assert!(validate_request(&request("07:30", 15, 90, 5, 5)).is_ok());
    }

    #[test]
    fn min_exceeding_max_is_rejected_even_when_both_in_range() {
        assert_eq!(
            validate_request(&request("07:30", 15, 90, 6, 4)),
            Err(ValidationError::CycleOrder { min: 6, max: 4 })
        );
    }

    #[test]
    fn error_messages_name_the_field() {
        let cases: Vec<(CalculateRequest, &str)> = vec![
            (request("07:30", 61, 90, 4, 6), "sleep_latency_min"),
            (request("07:30", 15, 111, 4, 6), "cycle_length_min"),
            (request("07:30", 15, 90, 0, 6), "min_cycles"),
            (request("07:30", 15, 90, 4, 11), "max_cycles"),
            (request("", 15, 90, 4, 6), "wake_time"),
        ];
        for (req, field) in cases {
            let err = validate_request(&req).expect_err(field);
            assert!(err.to_string().contains(field), "{field}: {err}");
        }
    }

    #[test]
    fn request_body_defaults_match_preferences_defaults() {
        let parsed: CalculateRequest =
            serde_json::from_str(r#"{"wake_time": "08:00"}"#).expect("valid body");
        let defaults = Preferences::default();
        assert_eq!(parsed.sleep_latency_min, defaults.sleep_latency_min);
        assert_eq!(parsed.cycle_length_min, defaults.cycle_length_min);
        assert_eq!(parsed.min_cycles, defaults.min_cycles);
        assert_eq!(parsed.max_cycles, defaults.max_cycles);
    }
}
