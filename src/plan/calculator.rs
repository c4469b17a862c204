use chrono::{Duration, NaiveTime};

use crate::plan::model::{SleepOption, format_clock_time};

/// Target band for a night of sleep: 7 to 9 hours.
pub const TARGET_SLEEP_MIN: u32 = 420;
pub const TARGET_SLEEP_MAX: u32 = 540;
/// Anchor used to break ties between options inside the target band.
const TARGET_SLEEP_ANCHOR: u32 = 450;

/// Computes bedtime candidates for every cycle count in `[min_cycles,
/// max_cycles]`, sorted by descending cycle count.
///
/// For n cycles the total sleep is `n * cycle_length - latency` minutes and
/// the bedtime is the wake time minus that total, wrapping across midnight.
/// Exactly one option comes back flagged as recommended: the one whose total
/// sleep best matches the 7-9 hour band.
///
/// Inputs are assumed to be validated already (see `model::validate_request`).
pub fn calculate(
    wake: NaiveTime,
    sleep_latency_min: u32,
    cycle_length_min: u32,
    min_cycles: u32,
    max_cycles: u32,
) -> Vec<SleepOption> {
    let mut options = (min_cycles..=max_cycles)
        .map(|cycles| build_option(wake, cycles, sleep_latency_min, cycle_length_min))
        .collect::<Vec<_>>();
    options.sort_by(|a, b| b.cycles.cmp(&a.cycles));

    // min_by_key keeps the first minimum, so with the descending sort in
    // place a full tie resolves toward more cycles.
    let best = options
        .iter()
        .enumerate()
        .min_by_key(|(_, option)| band_score(option.total_sleep_minutes))
        .map(|(index, _)| index);
    if let Some(index) = best {
        options[index].recommended = true;
    }
    options
}

/// Distance to the 7-9h band, then distance to the in-band anchor.
fn band_score(total_sleep_min: u32) -> (u32, u32) {
    let band_distance = if total_sleep_min < TARGET_SLEEP_MIN {
        TARGET_SLEEP_MIN - total_sleep_min
    } else if total_sleep_min > TARGET_SLEEP_MAX {
        total_sleep_min - TARGET_SLEEP_MAX
    } else {
        0
    };
    (band_distance, total_sleep_min.abs_diff(TARGET_SLEEP_ANCHOR))
}

fn build_option(
    wake: NaiveTime,
    cycles: u32,
    sleep_latency_min: u32,
    cycle_length_min: u32,
) -> SleepOption {
    let cycle_time_min = cycles * cycle_length_min;
    let total_sleep_min = cycle_time_min.saturating_sub(sleep_latency_min);
    let bedtime = wake - Duration::minutes(i64::from(total_sleep_min));

    let note = format!(
        "{cycles} cycles = {}h {}m ({cycle_time_min} min), minus {sleep_latency_min} min to \
         fall asleep = {}h {}m of sleep",
        cycle_time_min / 60,
        cycle_time_min % 60,
        total_sleep_min / 60,
        total_sleep_min % 60,
    );

    SleepOption {
        cycles,
        bedtime: format_clock_time(bedtime),
        total_sleep_hours: f64::from(total_sleep_min) / 60.0,
        total_sleep_minutes: total_sleep_min,
        recommended: false,
        note,
    }
}
