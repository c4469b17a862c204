use std::time::Duration as StdDuration;

use chrono::{DateTime, Days, Duration, Local, LocalResult, NaiveTime, TimeZone};

use crate::plan::model::{SleepOption, parse_clock_time};

/// Fixed recomputation period for the watch loop.
pub const TICK_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// A bedtime whose clock time is at least this far behind "now" is read as
/// tonight (it crossed midnight relative to the moment of calculation);
/// anything more recent than that was genuinely missed.
const WRAPAROUND_THRESHOLD_HOURS: i64 = 12;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CandidatePhase {
    /// Counting down; remaining time is positive.
    Active,
    /// Fired its one-shot side effect. Terminal.
    Due,
    /// Missed before the countdown started. Terminal.
    Past,
}

#[derive(Debug, Clone)]
pub struct CandidateTimer {
    pub bedtime: String,
    pub cycles: u32,
    target: Option<DateTime<Local>>,
    phase: CandidatePhase,
}

impl CandidateTimer {
    pub fn phase(&self) -> CandidatePhase {
        self.phase
    }

    /// Time left until this bedtime, or None once the timer is terminal.
    pub fn remaining(&self, now: DateTime<Local>) -> Option<Duration> {
        if self.phase != CandidatePhase::Active {
            return None;
        }
        self.target.map(|target| target - now)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    /// Candidates that reached their bedtime on this tick, each at most once.
    pub due: Vec<DueCandidate>,
}

#[derive(Debug, Clone)]
pub struct DueCandidate {
    pub bedtime: String,
    pub cycles: u32,
}

/// Owns every live countdown. At most one timer exists per distinct bedtime
/// string; replacing a result set drops all prior timers wholesale before
/// any new one is created.
#[derive(Debug, Default)]
pub struct CountdownBoard {
    entries: Vec<CandidateTimer>,
}

impl CountdownBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears every existing timer, then creates one per option.
    pub fn rebuild(&mut self, options: &[SleepOption], now: DateTime<Local>) {
        self.entries.clear();
        for option in options {
            if self.entries.iter().any(|e| e.bedtime == option.bedtime) {
                continue;
            }
            let Ok(bedtime) = parse_clock_time(&option.bedtime) else {
                continue;
            };
            let target = resolve_target(bedtime, now);
            self.entries.push(CandidateTimer {
                bedtime: option.bedtime.clone(),
                cycles: option.cycles,
                target,
                phase: if target.is_some() {
                    CandidatePhase::Active
                } else {
                    CandidatePhase::Past
                },
            });
        }
    }

    /// Recomputes every active timer against `now`. A timer whose remaining
    /// time has reached zero moves to `Due`, is reported once, and never
    /// fires again.
    pub fn tick(&mut self, now: DateTime<Local>) -> TickOutcome {
        let mut outcome = TickOutcome::default();
        for entry in &mut self.entries {
            if entry.phase != CandidatePhase::Active {
                continue;
            }
            let Some(target) = entry.target else {
                entry.phase = CandidatePhase::Past;
                continue;
            };
            if now >= target {
                entry.phase = CandidatePhase::Due;
                outcome.due.push(DueCandidate {
                    bedtime: entry.bedtime.clone(),
                    cycles: entry.cycles,
                });
            }
        }
        outcome
    }

    pub fn entries(&self) -> &[CandidateTimer] {
        &self.entries
    }

    pub fn all_terminal(&self) -> bool {
        self.entries
            .iter()
            .all(|entry| entry.phase != CandidatePhase::Active)
    }
}

/// Maps a bare clock time to the instant it refers to.
///
/// A time not yet behind us today counts as today; exactly "now" stays a
/// live target so the first tick reports it due. A time behind us is
/// tonight's bedtime if it sits at least twelve hours in the past (it
/// crossed midnight: "00:15" seen at 22:00 means in two and a quarter
/// hours), and genuinely missed otherwise.
fn resolve_target(bedtime: NaiveTime, now: DateTime<Local>) -> Option<DateTime<Local>> {
    let today = resolve_local(now.date_naive().and_time(bedtime))?;
    if today >= now {
        return Some(today);
    }
    if now - today >= Duration::hours(WRAPAROUND_THRESHOLD_HOURS) {
        let tomorrow = now.date_naive().checked_add_days(Days::new(1))?;
        return resolve_local(tomorrow.and_time(bedtime));
    }
    None
}

fn resolve_local(naive: chrono::NaiveDateTime) -> Option<DateTime<Local>> {
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(first, _second) => Some(first),
        LocalResult::None => None,
    }
}
