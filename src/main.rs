mod api;
mod client;
mod countdown;
mod ics;
mod plan;

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveTime};
use clap::{Args, Parser, Subcommand};
use notify_rust::{Notification, Urgency};
use tracing_subscriber::EnvFilter;

use crate::api::{ApiServer, ApiServerConfig};
use crate::client::{ApiClient, resolve_base};
use crate::countdown::{CandidatePhase, CountdownBoard, TICK_INTERVAL};
use crate::plan::calculator;
use crate::plan::model::{
    CalculateRequest, CalculateResponse, Parameters, Preferences, format_clock_time,
    parse_clock_time, validate_parameters, validate_request,
};

#[derive(Parser, Debug)]
#[command(
    name = "sleepcycle",
    version,
    about = "Plan bedtimes around whole sleep cycles"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bedtime calculation API.
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Calculate bedtime options for a wake-up time.
    Plan(PlanArgs),
    /// Inspect or change the server-side default parameters.
    Prefs {
        #[command(subcommand)]
        action: PrefsAction,
    },
}

#[derive(Args, Debug)]
struct PlanArgs {
    /// Wake-up time in HH:MM (24-hour).
    wake_time: String,

    /// Minutes you typically need to fall asleep (0-60).
    #[arg(long, default_value_t = plan::model::DEFAULT_SLEEP_LATENCY_MIN)]
    latency: u32,

    /// Length of one sleep cycle in minutes (60-110).
    #[arg(long, default_value_t = plan::model::DEFAULT_CYCLE_LENGTH_MIN)]
    cycle: u32,

    /// Fewest cycles to consider (1-10).
    #[arg(long, default_value_t = plan::model::DEFAULT_MIN_CYCLES)]
    min_cycles: u32,

    /// Most cycles to consider (1-10).
    #[arg(long, default_value_t = plan::model::DEFAULT_MAX_CYCLES)]
    max_cycles: u32,

    /// API base URL; falls back to $SLEEPCYCLE_API, then the local default.
    #[arg(long)]
    api: Option<String>,

    /// Compute locally instead of calling the API.
    #[arg(long)]
    offline: bool,

    /// Write one .ics calendar file per option into this directory.
    #[arg(long, value_name = "DIR")]
    export_ics: Option<PathBuf>,

    /// Keep running and count down to each bedtime (one check per minute).
    #[arg(long)]
    watch: bool,

    /// Opt in to desktop notifications.
    #[arg(long)]
    notify: bool,
}

#[derive(Subcommand, Debug)]
enum PrefsAction {
    /// Show the stored defaults.
    Get {
        #[arg(long)]
        api: Option<String>,
    },
    /// Replace the stored defaults.
    Set {
        #[arg(long, default_value_t = plan::model::DEFAULT_SLEEP_LATENCY_MIN)]
        latency: u32,

        #[arg(long, default_value_t = plan::model::DEFAULT_CYCLE_LENGTH_MIN)]
        cycle: u32,

        #[arg(long, default_value_t = plan::model::DEFAULT_MIN_CYCLES)]
        min_cycles: u32,

        #[arg(long, default_value_t = plan::model::DEFAULT_MAX_CYCLES)]
        max_cycles: u32,

        #[arg(long)]
        api: Option<String>,
    },
    /// Reset the stored defaults.
    Reset {
        #[arg(long)]
        api: Option<String>,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { bind, port } => run_serve(bind, port),
        Command::Plan(args) => run_plan(args),
        Command::Prefs { action } => run_prefs(action),
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sleepcycle=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_serve(bind: String, port: u16) -> Result<()> {
    let server = ApiServer::start(ApiServerConfig {
        bind_addr: bind,
        port,
    })
    .context("failed to start the calculation API")?;
    println!(
        "sleepcycle API v{} listening on http://{}",
        api::API_VERSION,
        server.local_addr()
    );
    server.wait();
    Ok(())
}

fn run_plan(args: PlanArgs) -> Result<()> {
    let request = CalculateRequest {
        wake_time: args.wake_time.clone(),
        sleep_latency_min: args.latency,
        cycle_length_min: args.cycle,
        min_cycles: args.min_cycles,
        max_cycles: args.max_cycles,
    };
    // Validation failures never reach the network.
    let wake = validate_request(&request)?;

    let response = if args.offline {
        offline_response(wake, &request)
    } else {
        let client = ApiClient::new(resolve_base(args.api))?;
        client.calculate(&request)?
    };

    render_plan(&response);

    if let Some(dir) = &args.export_ics {
        export_calendar_files(&response, wake, dir)?;
    }

    let notify = if args.notify {
        enable_notifications()
    } else {
        false
    };

    if args.watch {
        run_watch(&response, notify);
    }
    Ok(())
}

fn offline_response(wake: NaiveTime, request: &CalculateRequest) -> CalculateResponse {
    CalculateResponse {
        wake_time: format_clock_time(wake),
        options: calculator::calculate(
            wake,
            request.sleep_latency_min,
            request.cycle_length_min,
            request.min_cycles,
            request.max_cycles,
        ),
        parameters: Parameters {
            sleep_latency_min: request.sleep_latency_min,
            cycle_length_min: request.cycle_length_min,
        },
    }
}

fn render_plan(response: &CalculateResponse) {
    println!("Bedtime options for waking at {}", response.wake_time);
    println!(
        "  sleep latency {} min, cycle length {} min",
        response.parameters.sleep_latency_min, response.parameters.cycle_length_min
    );
    println!();
    for (index, option) in response.options.iter().enumerate() {
        let marker = if option.recommended {
            "  <- recommended"
        } else {
            ""
        };
        println!(
            "{}. go to bed at {}  ({} cycles, {}h {:02}m of sleep){marker}",
            index + 1,
            option.bedtime,
            option.cycles,
            option.total_sleep_minutes / 60,
            option.total_sleep_minutes % 60,
        );
        println!("   {}", option.note);
    }
}

fn export_calendar_files(response: &CalculateResponse, wake: NaiveTime, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("unable to create export directory {}", dir.display()))?;
    let now = Local::now();
    for option in &response.options {
        let bedtime = parse_clock_time(&option.bedtime)
            .with_context(|| format!("calculator returned malformed bedtime '{}'", option.bedtime))?;
        let path = dir.join(ics::calendar_filename(bedtime));
        let blob = ics::calendar_blob(bedtime, wake, option.cycles, now);
        fs::write(&path, blob)
            .with_context(|| format!("unable to write calendar file {}", path.display()))?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

/// The notification opt-in: fires a confirmation immediately and reports
/// whether notifications actually work here. A missing notification daemon
/// disables the feature without failing the run.
fn enable_notifications() -> bool {
    match Notification::new()
        .summary("sleepcycle")
        .body("Notifications enabled. You will be pinged at bedtime.")
        .appname("sleepcycle")
        .icon("alarm-clock")
        .show()
    {
        Ok(_) => {
            println!("Desktop notifications enabled.");
            true
        }
        Err(err) => {
            eprintln!("warning: desktop notifications unavailable: {err}");
            false
        }
    }
}

fn run_watch(response: &CalculateResponse, notify: bool) {
    let mut board = CountdownBoard::new();
    board.rebuild(&response.options, Local::now());

    for entry in board.entries() {
        if entry.phase() == CandidatePhase::Past {
            println!("{} has already passed; skipping its countdown", entry.bedtime);
        }
    }
    let active = board
        .entries()
        .iter()
        .filter(|entry| entry.phase() == CandidatePhase::Active)
        .count();
    if active == 0 {
        println!("Nothing to watch; every bedtime has already passed.");
        return;
    }
    println!("Watching {active} bedtime(s); checking once a minute. Ctrl-C to stop.");

    loop {
        let now = Local::now();
        let outcome = board.tick(now);
        for due in &outcome.due {
            println!("{} - time to head to bed ({} cycles)", due.bedtime, due.cycles);
            if notify {
                send_bedtime_notification(&due.bedtime, due.cycles);
            }
        }
        for entry in board.entries() {
            if entry.phase() != CandidatePhase::Active {
                continue;
            }
            if let Some(remaining) = entry.remaining(now) {
                println!("{} in {}", entry.bedtime, format_remaining(remaining));
            }
        }
        if board.all_terminal() {
            println!("All bedtimes have passed.");
            return;
        }
        thread::sleep(TICK_INTERVAL);
    }
}

fn send_bedtime_notification(bedtime: &str, cycles: u32) {
    if let Err(err) = Notification::new()
        .summary("Time for bed")
        .body(&format!(
            "It is {bedtime}: head to bed now to fit {cycles} sleep cycles."
        ))
        .appname("sleepcycle")
        .icon("alarm-clock")
        .urgency(Urgency::Critical)
        .show()
    {
        tracing::warn!("bedtime notification failed: {err}");
    }
}

fn format_remaining(remaining: Duration) -> String {
    let minutes = remaining.num_minutes().max(0);
    format!("{}h {:02}m", minutes / 60, minutes % 60)
}

fn run_prefs(action: PrefsAction) -> Result<()> {
    match action {
        PrefsAction::Get { api } => {
            let client = ApiClient::new(resolve_base(api))?;
            print_preferences(&client.get_preferences()?);
        }
        PrefsAction::Set {
            latency,
            cycle,
            min_cycles,
            max_cycles,
            api,
        } => {
            validate_parameters(latency, cycle, min_cycles, max_cycles)?;
            let client = ApiClient::new(resolve_base(api))?;
            let saved = client.set_preferences(&Preferences {
                sleep_latency_min: latency,
                cycle_length_min: cycle,
                min_cycles,
                max_cycles,
            })?;
            println!("{}", saved.message);
            print_preferences(&saved.preferences);
        }
        PrefsAction::Reset { api } => {
            let client = ApiClient::new(resolve_base(api))?;
            let saved = client.reset_preferences()?;
            println!("{}", saved.message);
            print_preferences(&saved.preferences);
        }
    }
    Ok(())
}

fn print_preferences(preferences: &Preferences) {
    println!("sleep latency: {} min", preferences.sleep_latency_min);
    println!("cycle length:  {} min", preferences.cycle_length_min);
    println!("cycles shown:  {}-{}", preferences.min_cycles, preferences.max_cycles);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_time_formats_as_hours_and_minutes() {
        assert_eq!(format_remaining(Duration::minutes(135)), "2h 15m");
        assert_eq!(format_remaining(Duration::minutes(5)), "0h 05m");
        assert_eq!(format_remaining(Duration::minutes(-3)), "0h 00m");
    }

    #[test]
    fn offline_response_matches_the_request_parameters() {
        let request = CalculateRequest {
            wake_time: "07:30".to_string(),
            sleep_latency_min: 15,
            cycle_length_min: 90,
            min_cycles: 4,
            max_cycles: 6,
        };
        let wake = validate_request(&request).expect("valid");
        let response = offline_response(wake, &request);
        assert_eq!(response.wake_time, "07:30");
        assert_eq!(response.options.len(), 3);
        assert_eq!(response.parameters.cycle_length_min, 90);
    }
}
