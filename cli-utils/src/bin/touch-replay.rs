//! Run a recorded trace of raw LDC1612 readings through the homing engine.
//!
//! The input contains one raw reading per line, either decimal or hex with a
//! `0x` prefix. Empty lines and lines starting with `#` are skipped. Useful
//! to tune thresholds and to check where a touch would have been detected.

use std::{
    fs,
    io::{self, Read},
    path::PathBuf,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use eddyprobe_common::clock::{add_ticks, Instant};
use eddyprobe_common::homing::{HomingEngine, HomingMode, HomingRequest, SampleOutcome, TriggerSync};

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Threshold,
    Touch,
}

impl From<Mode> for HomingMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Threshold => HomingMode::Threshold,
            Mode::Touch => HomingMode::Touch,
        }
    }
}

#[derive(Parser)]
struct Opts {
    /// Trace file, reads from stdin if omitted.
    trace: Option<PathBuf>,

    #[clap(short, long, value_enum, default_value = "touch")]
    mode: Mode,

    /// Trigger threshold for threshold homing. Must not be zero, it is
    /// ignored in touch mode.
    #[clap(short, long, default_value = "1")]
    threshold: u32,

    /// Sample interval in ticks (1 MHz).
    #[clap(short, long, default_value = "2000")]
    interval: u32,

    /// Number of leading samples within the grace window.
    #[clap(short, long, default_value = "0")]
    grace_samples: u32,

    /// Print slope and corner count of every sample.
    #[clap(short, long)]
    verbose: bool,
}

/// Records notifications instead of halting the motion controller.
#[derive(Default)]
struct ReplaySync {
    notifications: Vec<(u8, u8)>,
}

impl TriggerSync for ReplaySync {
    fn trigger(&mut self, sync_oid: u8, reason: u8) {
        log::debug!("Sync {} notified with reason {}", sync_oid, reason);
        self.notifications.push((sync_oid, reason));
    }
}

const TRIGGER_REASON: u8 = 1;
const ERROR_REASON: u8 = 2;

fn parse_value(line: &str) -> Result<u32> {
    let value = match line.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => line.parse()?,
    };
    Ok(value)
}

fn parse_trace(source: &str) -> Result<Vec<u32>> {
    source
        .lines()
        .enumerate()
        .map(|(i, line)| (i, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(i, line)| parse_value(line).with_context(|| format!("Line {}: {:?}", i + 1, line)))
        .collect()
}

/// Index of the notifying sample and its outcome.
struct ReplayResult {
    index: Option<usize>,
    outcome: SampleOutcome,
    notifications: Vec<(u8, u8)>,
}

fn replay(opts: &Opts, trace: &[u32]) -> ReplayResult {
    let mut engine = HomingEngine::new();
    let mut sync = ReplaySync::default();
    let start = Instant::from_ticks(0);
    engine.setup(&HomingRequest {
        grace_deadline: add_ticks(start, opts.grace_samples.wrapping_mul(opts.interval)),
        trigger_threshold: opts.threshold,
        sync_oid: 0,
        trigger_reason: TRIGGER_REASON,
        error_reason: ERROR_REASON,
        mode: opts.mode.into(),
    });

    for (i, &data) in trace.iter().enumerate() {
        let now = add_ticks(start, (i as u32).wrapping_mul(opts.interval));
        let outcome = engine.check_sample(data, now, &mut sync);
        if opts.verbose {
            println!(
                "{:6} {:10} slope={:7} corners={:3} {:?}",
                i,
                data,
                engine.touch().last_slope(),
                engine.touch().corner_count(),
                outcome
            );
        }
        if matches!(
            outcome,
            SampleOutcome::Triggered { .. } | SampleOutcome::Errored { .. }
        ) {
            return ReplayResult {
                index: Some(i),
                outcome,
                notifications: sync.notifications,
            };
        }
    }
    ReplayResult {
        index: None,
        outcome: SampleOutcome::Pending,
        notifications: sync.notifications,
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let opts: Opts = Opts::parse();
    if opts.threshold == 0 {
        bail!("A zero threshold disarms homing");
    }

    let source = match &opts.trace {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?,
        None => {
            let mut source = String::new();
            io::stdin()
                .read_to_string(&mut source)
                .context("Could not read stdin")?;
            source
        }
    };
    let trace = parse_trace(&source)?;
    log::info!("Replaying {} samples in {:?} mode", trace.len(), opts.mode);

    let result = replay(&opts, &trace);
    log::info!("{} notification(s) sent", result.notifications.len());
    match (result.index, result.outcome) {
        (Some(i), SampleOutcome::Triggered { .. }) => {
            println!("Triggered at sample {} (raw {})", i, trace[i])
        }
        (Some(i), SampleOutcome::Errored { .. }) => {
            println!("Sensor error at sample {} (raw {:#010x})", i, trace[i])
        }
        _ => println!("No trigger"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(mode: Mode, threshold: u32) -> Opts {
        Opts {
            trace: None,
            mode,
            threshold,
            interval: 2000,
            grace_samples: 0,
            verbose: false,
        }
    }

    #[test]
    fn test_parse_trace() {
        let trace = parse_trace("# header\n100\n\n  0x10  \n").unwrap();
        assert_eq!(trace, vec![100, 16]);
        let err = parse_trace("1\nabc\n").unwrap_err();
        assert!(err.to_string().starts_with("Line 2"));
    }

    #[test]
    fn test_threshold_replay() {
        let result = replay(&opts(Mode::Threshold, 1000), &[500, 900, 1500, 2000]);
        assert_eq!(result.index, Some(2));
        assert_eq!(result.notifications, vec![(0, TRIGGER_REASON)]);
        assert_eq!(
            result.outcome,
            SampleOutcome::Triggered {
                reason: TRIGGER_REASON
            }
        );
    }

    #[test]
    fn test_grace_samples_delay_trigger() {
        let mut opts = opts(Mode::Threshold, 1000);
        opts.grace_samples = 3;
        let result = replay(&opts, &[1500, 1600, 1700, 1800]);
        assert_eq!(result.index, Some(3));
    }

    #[test]
    fn test_sensor_error_replay() {
        let result = replay(&opts(Mode::Touch, 1), &[3_000_000, 0x1000_0000]);
        assert_eq!(result.index, Some(1));
        assert_eq!(
            result.outcome,
            SampleOutcome::Errored {
                reason: ERROR_REASON
            }
        );
    }

    #[test]
    fn test_touch_replay_without_touch() {
        let trace: Vec<u32> = (0..100).map(|i| 3_000_000 + i % 2).collect();
        let result = replay(&opts(Mode::Touch, 1), &trace);
        assert_eq!(result.index, None);
        assert!(result.notifications.is_empty());
    }
}
