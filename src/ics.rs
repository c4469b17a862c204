use chrono::{DateTime, Days, Duration, Local, NaiveDateTime, NaiveTime};
use uuid::Uuid;

use crate::plan::model::format_clock_time;

/// Lead time of the single reminder alarm before bedtime.
const REMINDER_LEAD: &str = "-PT15M";
const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Builds an iCalendar record for one bedtime candidate.
///
/// Deterministic apart from the UID: the event starts today if the bedtime
/// has not yet passed and tomorrow otherwise, ends after the bedtime-to-wake
/// span (rolling over midnight when the wake time is not later in the same
/// day), and carries one display alarm 15 minutes before the start.
pub fn calendar_blob(
    bedtime: NaiveTime,
    wake: NaiveTime,
    cycles: u32,
    now: DateTime<Local>,
) -> String {
    let start = resolve_start(bedtime, now);
    let end = start + sleep_span(bedtime, wake);
    let uid = Uuid::new_v4();

    let lines = [
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".to_string(),
        "PRODID:-//sleepcycle//bedtime planner//EN".to_string(),
        "BEGIN:VEVENT".to_string(),
        format!("UID:{uid}@sleepcycle"),
        format!("DTSTAMP:{}", now.naive_local().format(TIMESTAMP_FORMAT)),
        format!("DTSTART:{}", start.format(TIMESTAMP_FORMAT)),
        format!("DTEND:{}", end.format(TIMESTAMP_FORMAT)),
        format!("SUMMARY:Bedtime ({cycles} sleep cycles)"),
        format!(
            "DESCRIPTION:Go to bed at {} to fit {cycles} sleep cycles before waking at {}.",
            format_clock_time(bedtime),
            format_clock_time(wake),
        ),
        "BEGIN:VALARM".to_string(),
        format!("TRIGGER:{REMINDER_LEAD}"),
        "ACTION:DISPLAY".to_string(),
        "DESCRIPTION:Bedtime in 15 minutes".to_string(),
        "END:VALARM".to_string(),
        "END:VEVENT".to_string(),
        "END:VCALENDAR".to_string(),
    ];
    let mut blob = lines.join("\r\n");
    blob.push_str("\r\n");
    blob
}

/// File name for an exported record: the bedtime with its separator stripped.
pub fn calendar_filename(bedtime: NaiveTime) -> String {
    format!("bedtime_{}.ics", bedtime.format("%H%M"))
}

fn resolve_start(bedtime: NaiveTime, now: DateTime<Local>) -> NaiveDateTime {
    let today = now.date_naive().and_time(bedtime);
    if today > now.naive_local() {
        today
    } else {
        // Clock time already passed; the export is for tomorrow night.
        now.date_naive()
            .checked_add_days(Days::new(1))
            .unwrap_or_else(|| now.date_naive())
            .and_time(bedtime)
    }
}

/// Wake-minus-bedtime span, rolling over midnight when the wake clock time
/// is not strictly after the bedtime clock time.
fn sleep_span(bedtime: NaiveTime, wake: NaiveTime) -> Duration {
    let span = wake - bedtime;
    if span > Duration::zero() {
        span
    } else {
        span + Duration::hours(24)
    }
}
