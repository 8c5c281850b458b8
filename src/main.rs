//! Qreadout - synthetic acquisition runner
//!
//! Arms a digitizer acquisition, feeds it from the synthetic packet source
//! until every stream reaches its record target, then prints the averaged,
//! correlated or raw results.

use anyhow::{bail, Context, Result};
use qreadout::{
    AcquisitionSettings, ChannelTriple, Digitizer, DigitizerMode, StreamId, SyntheticSource,
    WAIT_POLL_INTERVAL,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

const DEFAULT_STREAMS: &str = "1.0.0,1.1.0,1.1.1,1.2.1";

/// Values shown per snapshot in the text report
const PREVIEW_LEN: usize = 6;

struct Options {
    streams: Vec<ChannelTriple>,
    settings: AcquisitionSettings,
    settings_path: Option<PathBuf>,
    save_settings: Option<PathBuf>,
    mode: DigitizerMode,
    max_arity: usize,
    timeout: Duration,
    json: bool,
}

#[derive(Serialize)]
struct StreamReport {
    sid: StreamId,
    triple: String,
    kind: String,
    records_taken: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    mean: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    variance: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<Vec<f64>>,
}

#[derive(Serialize)]
struct CorrelationReport {
    sids: Vec<StreamId>,
    mean: Vec<f64>,
    variance: Vec<f64>,
}

#[derive(Serialize)]
struct Report {
    version: &'static str,
    generated_at: chrono::DateTime<chrono::Utc>,
    mode: DigitizerMode,
    settings: AcquisitionSettings,
    completed: bool,
    elapsed_ms: u128,
    streams: Vec<StreamReport>,
    correlations: Vec<CorrelationReport>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new("qreadout=info,qreadout_core=info")
                }),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(options) = parse_args(&args)? else {
        return Ok(());
    };

    if let Some(path) = &options.save_settings {
        options
            .settings
            .save(path)
            .with_context(|| format!("saving settings to {}", path.display()))?;
    }

    let report = run(&options)?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_help() {
    println!("Usage: qreadout [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -s, --streams A.B.C,...   Streams to enable (default: {})", DEFAULT_STREAMS);
    println!("  -l, --record-length N     Record length in ADC samples (default: 1024)");
    println!("      --segments N          Segments per round robin (default: 1)");
    println!("      --waveforms N         Waveforms per segment (default: 1)");
    println!("      --round-robins N      Round robins (default: 1)");
    println!("  -m, --mode MODE           averager or digitizer (default: averager)");
    println!("      --arity N             Largest correlation arity (default: 2)");
    println!("      --settings FILE       Load acquisition settings from a JSON file");
    println!("      --save-settings FILE  Save the effective settings to a JSON file");
    println!("  -t, --timeout SECS        Give up after this many seconds (default: 10)");
    println!("      --json                Print the report as JSON");
    println!("  -v, --version             Show version");
    println!("  -h, --help                Show this help");
    println!();
    println!("Examples:");
    println!("  qreadout --streams 1.1.1,1.2.1,2.1.1 --segments 4 --round-robins 100");
    println!("  qreadout --mode digitizer --streams 1.0.0 --record-length 256 --json");
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    match args.get(i + 1) {
        Some(v) => Ok(v.as_str()),
        None => bail!("{} requires a value", flag),
    }
}

fn number(args: &[String], i: usize, flag: &str) -> Result<usize> {
    let raw = value(args, i, flag)?;
    raw.parse()
        .with_context(|| format!("invalid value '{}' for {}", raw, flag))
}

fn parse_streams(list: &str) -> Result<Vec<ChannelTriple>> {
    list.split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<ChannelTriple>().map_err(anyhow::Error::msg))
        .collect()
}

/// Parse command-line flags; `None` means the command already finished (help, version)
fn parse_args(args: &[String]) -> Result<Option<Options>> {
    // the settings file is the base; explicit flags override it
    let settings_path = args
        .iter()
        .position(|a| a == "--settings")
        .map(|i| value(args, i, "--settings").map(PathBuf::from))
        .transpose()?;
    let settings = match &settings_path {
        Some(path) => AcquisitionSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => AcquisitionSettings::default(),
    };

    let mut options = Options {
        streams: parse_streams(DEFAULT_STREAMS)?,
        settings,
        settings_path,
        save_settings: None,
        mode: DigitizerMode::default(),
        max_arity: qreadout::DEFAULT_MAX_CORRELATION_ARITY,
        timeout: Duration::from_secs(10),
        json: false,
    };

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            "--version" | "-v" => {
                println!("qreadout {} ({})", qreadout::VERSION, qreadout::BUILD_DATE);
                return Ok(None);
            }
            "--json" => {
                options.json = true;
                i += 1;
                continue;
            }
            "--streams" | "-s" => options.streams = parse_streams(value(args, i, flag)?)?,
            "--record-length" | "-l" => options.settings.record_length = number(args, i, flag)?,
            "--segments" => options.settings.num_segments = number(args, i, flag)?,
            "--waveforms" => options.settings.num_waveforms = number(args, i, flag)?,
            "--round-robins" => options.settings.round_robins = number(args, i, flag)?,
            "--arity" => options.max_arity = number(args, i, flag)?,
            "--mode" | "-m" => {
                options.mode = value(args, i, flag)?
                    .parse()
                    .map_err(anyhow::Error::msg)?
            }
            "--timeout" | "-t" => options.timeout = Duration::from_secs(number(args, i, flag)? as u64),
            "--settings" => {}
            "--save-settings" => options.save_settings = Some(PathBuf::from(value(args, i, flag)?)),
            other => {
                eprintln!("Unknown argument: {}", other);
                print_help();
                bail!("unknown argument '{}'", other);
            }
        }
        i += 2;
    }

    if options.streams.is_empty() {
        bail!("no streams selected");
    }
    Ok(Some(options))
}

fn run(options: &Options) -> Result<Report> {
    let mut digitizer = Digitizer::new();
    for &triple in &options.streams {
        digitizer.enable_stream(triple)?;
    }
    digitizer.set_averager_settings(options.settings)?;
    digitizer.set_mode(options.mode)?;
    digitizer.set_max_correlation_arity(options.max_arity)?;
    if let Some(path) = &options.settings_path {
        info!(path = %path.display(), "Using settings file");
    }

    let source = SyntheticSource::new(&digitizer.streams(), digitizer.settings());
    let port = digitizer.acquire()?;
    let (tx, rx) = crossbeam_channel::bounded(256);
    let mut delivery = port.spawn(rx)?;
    let feeder = source.spawn(tx)?;

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .ok();

    let started = Instant::now();
    while digitizer.is_running() {
        if interrupted.load(Ordering::SeqCst) {
            info!("Interrupted, stopping acquisition");
            digitizer.stop();
            break;
        }
        if started.elapsed() > options.timeout {
            error!(timeout = ?options.timeout, "Acquisition timed out");
            digitizer.stop();
            break;
        }
        let fresh = digitizer.num_new_records();
        if fresh > 0 {
            debug!(new_records = fresh, "Acquisition progress");
        }
        std::thread::sleep(WAIT_POLL_INTERVAL);
    }
    let elapsed = started.elapsed();

    delivery.stop();
    if feeder.join().is_err() {
        error!("Synthetic source thread panicked");
    }

    let completed = digitizer.is_done();
    info!(
        completed,
        elapsed_ms = elapsed.as_millis() as u64,
        delivered = delivery.delivered(),
        "Acquisition finished"
    );
    collect_report(&digitizer, completed, elapsed)
}

fn collect_report(digitizer: &Digitizer, completed: bool, elapsed: Duration) -> Result<Report> {
    let mode = digitizer.mode();
    let mut streams = Vec::new();
    for stream in digitizer.streams() {
        let sid = stream.id;
        let size = digitizer.buffer_size(&[sid])?;
        let mut data = vec![0.0; size];
        let n = digitizer.transfer_stream(sid, &mut data)?;
        data.truncate(n);

        let (mean, variance, records) = match mode {
            DigitizerMode::Averager => {
                let mut var = vec![0.0; digitizer.variance_buffer_size(&[sid])?];
                digitizer.transfer_variance(sid, &mut var)?;
                (Some(data), Some(var), None)
            }
            DigitizerMode::Digitizer => (None, None, Some(data)),
        };

        streams.push(StreamReport {
            sid,
            triple: stream.triple.to_string(),
            kind: stream.kind.to_string(),
            records_taken: digitizer.records_taken(sid)?,
            mean,
            variance,
            records,
        });
    }

    let mut correlations = Vec::new();
    if mode == DigitizerMode::Averager {
        for sids in digitizer.correlator_sets() {
            let mut mean = vec![0.0; digitizer.buffer_size(&sids)?];
            digitizer.transfer_correlation(&sids, &mut mean)?;
            let mut variance = vec![0.0; digitizer.variance_buffer_size(&sids)?];
            digitizer.transfer_correlation_variance(&sids, &mut variance)?;
            correlations.push(CorrelationReport {
                sids,
                mean,
                variance,
            });
        }
    }

    Ok(Report {
        version: qreadout::VERSION,
        generated_at: chrono::Utc::now(),
        mode,
        settings: digitizer.settings(),
        completed,
        elapsed_ms: elapsed.as_millis(),
        streams,
        correlations,
    })
}

fn preview(values: &[f64]) -> String {
    let shown: Vec<String> = values
        .iter()
        .take(PREVIEW_LEN)
        .map(|v| format!("{:>10.5}", v))
        .collect();
    let more = if values.len() > PREVIEW_LEN {
        format!(" ... ({} values)", values.len())
    } else {
        String::new()
    };
    format!("[{}]{}", shown.join(", "), more)
}

fn print_report(report: &Report) {
    println!("qreadout v{} - {} mode", report.version, report.mode);
    println!(
        "record length {} | {} segments x {} waveforms x {} round robins = {} records",
        report.settings.record_length,
        report.settings.num_segments,
        report.settings.num_waveforms,
        report.settings.round_robins,
        report.settings.num_records()
    );
    println!(
        "{} in {} ms",
        if report.completed { "Completed" } else { "INCOMPLETE" },
        report.elapsed_ms
    );
    println!("────────────────────────────────────────");

    for s in &report.streams {
        println!("{} {} ({}) - {} records", s.sid, s.triple, s.kind, s.records_taken);
        if let Some(mean) = &s.mean {
            println!("  mean:     {}", preview(mean));
        }
        if let Some(var) = &s.variance {
            println!("  variance: {}", preview(var));
        }
        if let Some(records) = &s.records {
            println!("  records:  {}", preview(records));
        }
    }

    for c in &report.correlations {
        let names: Vec<String> = c.sids.iter().map(|s| s.to_string()).collect();
        println!("correlation {}", names.join(" x "));
        println!("  mean:     {}", preview(&c.mean));
        println!("  variance: {}", preview(&c.variance));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_defaults() {
        let options = parse_args(&[]).unwrap().unwrap();
        assert_eq!(options.streams.len(), 4);
        assert_eq!(options.mode, DigitizerMode::Averager);
        assert_eq!(options.settings, AcquisitionSettings::default());
        assert!(!options.json);
    }

    #[test]
    fn test_parse_flags() {
        let options = parse_args(&args(&[
            "--streams", "1.1.1,1.2.1", "--segments", "4", "--round-robins", "10", "--mode",
            "digitizer", "--json", "--arity", "3",
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(options.streams, vec![ChannelTriple::new(1, 1, 1), ChannelTriple::new(1, 2, 1)]);
        assert_eq!(options.settings.num_segments, 4);
        assert_eq!(options.settings.round_robins, 10);
        assert_eq!(options.mode, DigitizerMode::Digitizer);
        assert_eq!(options.max_arity, 3);
        assert!(options.json);
    }

    #[test]
    fn test_settings_file_then_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        AcquisitionSettings::new(512, 2, 2, 2).save(&path).unwrap();

        let options = parse_args(&args(&["--settings", path.to_str().unwrap(), "--segments", "8"]))
            .unwrap()
            .unwrap();
        assert_eq!(options.settings.record_length, 512);
        assert_eq!(options.settings.num_segments, 8);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args(&args(&["--segments"])).is_err());
        assert!(parse_args(&args(&["--segments", "many"])).is_err());
        assert!(parse_args(&args(&["--streams", "1.1"])).is_err());
        assert!(parse_args(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn test_run_reports_averages_and_correlations() {
        let options = parse_args(&args(&["--record-length", "128", "--segments", "2", "--round-robins", "2"]))
            .unwrap()
            .unwrap();
        let report = run(&options).unwrap();
        assert!(report.completed);
        assert_eq!(report.streams.len(), 4);
        assert!(report.streams.iter().all(|s| s.records_taken == 4));
        assert_eq!(report.correlations.len(), 1);
        assert_eq!(report.correlations[0].mean.len(), 4);
    }
}
