//! Scribeflow — chunked, resumable media transcription orchestration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use scribeflow_core::ScribeConfig;
use scribeflow_runtime::{MemoryRecorder, TelemetryEvent, TelemetrySink, TelemetrySummary};
use scribeflow_store::ManifestStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn resolve_data_dir() -> PathBuf {
    std::env::var("SCRIBEFLOW_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"))
}

fn resolve_config_file(data_dir: &Path) -> PathBuf {
    std::env::var("SCRIBEFLOW_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| data_dir.join("scribeflow.json"))
}

fn print_usage() {
    println!("Scribeflow — chunked, resumable media transcription");
    println!();
    println!("Usage: scribeflow <command>");
    println!();
    println!("Commands:");
    println!("  plan <duration-seconds> <size-bytes>   Print the chunk plan as JSON");
    println!("  status <source>                        Show manifest progress for a source");
    println!("  fingerprint <file>                     Print the content fingerprint");
    println!("  summary [telemetry.ndjson]             Roll up usage and cost from a telemetry log");
    println!("                                         (default: <data-dir>/telemetry/events.ndjson)");
    println!("  help                                   Show this help message");
    println!();
    println!("Environment:");
    println!("  SCRIBEFLOW_DATA_DIR   data directory (default: data)");
    println!("  SCRIBEFLOW_CONFIG     config file (default: <data-dir>/scribeflow.json)");
    println!("  SCRIBEFLOW_MODEL, SCRIBEFLOW_MAX_WORKERS, SCRIBEFLOW_MAX_VIDEO_WORKERS,");
    println!("  SCRIBEFLOW_TOKEN_BUDGET   override the matching config values");
}

fn load_config() -> anyhow::Result<ScribeConfig> {
    let data_dir = resolve_data_dir();
    let config_file = resolve_config_file(&data_dir);
    let config_file = config_file.exists().then_some(config_file);
    info!("Data directory: {}", data_dir.display());
    Ok(ScribeConfig::load(config_file.as_deref(), &data_dir)?)
}

/// Planned windows for an asset of the given shape, as JSON.
fn plan_json(config: &ScribeConfig, duration: f64, size_bytes: u64) -> serde_json::Value {
    let params = config.planning.params();
    let windows = scribeflow_ingest::plan_chunks(duration, size_bytes, &params);
    let chunk_seconds = scribeflow_ingest::effective_chunk_seconds(duration, size_bytes, &params);
    serde_json::json!({
        "planning": params,
        "effective_chunk_seconds": chunk_seconds,
        "chunks": windows,
    })
}

/// Read an NDJSON telemetry log and roll it up. Malformed lines are skipped.
fn summarize_log(path: &Path) -> anyhow::Result<TelemetrySummary> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let recorder = MemoryRecorder::new();
    for (number, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TelemetryEvent>(line) {
            Ok(event) => recorder.record(event),
            Err(e) => warn!("Skipping line {} of {}: {}", number + 1, path.display(), e),
        }
    }
    Ok(recorder.summarize())
}

fn require_arg<'a>(args: &'a [String], index: usize, usage: &str) -> &'a str {
    match args.get(index) {
        Some(arg) => arg.as_str(),
        None => {
            eprintln!("Usage: scribeflow {}", usage);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1) else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "plan" => {
            let usage = "plan <duration-seconds> <size-bytes>";
            let duration: f64 = require_arg(&args, 2, usage)
                .parse()
                .context("duration must be a number of seconds")?;
            let size_bytes: u64 = require_arg(&args, 3, usage)
                .parse()
                .context("size must be a number of bytes")?;
            let config = load_config()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&plan_json(&config, duration, size_bytes))?
            );
        }
        "status" => {
            let source = require_arg(&args, 2, "status <source>");
            let config = load_config()?;
            let store = ManifestStore::new(&config.data_paths.manifests)?;
            match store.find(source)? {
                Some(manifest) => {
                    let progress = manifest.progress();
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "source": manifest.source,
                            "asset_fingerprint": manifest.asset_fingerprint,
                            "model": manifest.planning.model,
                            "progress": progress,
                            "complete": progress.is_complete(),
                            "updated_utc": manifest.updated_utc,
                        }))?
                    );
                }
                None => {
                    eprintln!("No manifest for {}", source);
                    std::process::exit(1);
                }
            }
        }
        "fingerprint" => {
            let file = require_arg(&args, 2, "fingerprint <file>");
            println!("{}", scribeflow_ingest::fingerprint_file(Path::new(file))?);
        }
        "summary" => {
            let file = match args.get(2) {
                Some(file) => PathBuf::from(file),
                None => load_config()?.data_paths.telemetry_log(),
            };
            let summary = summarize_log(&file)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        "--help" | "-h" | "help" => print_usage(),
        other => {
            eprintln!("Unknown command: {}. Use 'scribeflow help' for usage.", other);
            std::process::exit(1);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scribeflow_core::Modality;
    use scribeflow_runtime::{NdjsonRecorder, Outcome};
    use uuid::Uuid;

    #[test]
    fn test_plan_json() {
        let mut config = ScribeConfig::default();
        config.planning.max_chunk_seconds = 3600.0;
        let plan = plan_json(&config, 7300.0, 0);
        assert_eq!(plan["chunks"].as_array().unwrap().len(), 8);
        assert_eq!(plan["effective_chunk_seconds"], 1000.0);
        assert_eq!(plan["chunks"][7]["end_seconds"], 7300.0);
        assert_eq!(plan["planning"]["token_budget"], 300_000);
    }

    #[test]
    fn test_summarize_log_skips_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.ndjson");
        let recorder = NdjsonRecorder::open(&path).unwrap();
        recorder.record(TelemetryEvent::new(
            Uuid::new_v4(),
            "gemini-2.5-flash-lite",
            Modality::Audio,
            0,
            Outcome::Success,
        ));
        drop(recorder);
        let mut data = std::fs::read_to_string(&path).unwrap();
        data.push_str("not json\n\n");
        std::fs::write(&path, data).unwrap();

        let summary = summarize_log(&path).unwrap();
        assert_eq!(summary.by_model["gemini-2.5-flash-lite"].successes, 1);
        assert_eq!(summary.by_modality["audio"].requests, 1);
        assert_eq!(summary.cost.total_cost, 0.0);
    }

    #[test]
    fn test_summarize_default_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScribeConfig::load(None, dir.path()).unwrap();
        let recorder = NdjsonRecorder::open(config.data_paths.telemetry_log()).unwrap();
        recorder.record(
            TelemetryEvent::new(
                Uuid::new_v4(),
                "gemini-2.5-flash-lite",
                Modality::Video,
                0,
                Outcome::Success,
            )
            .chunk_seconds(1000.0),
        );
        drop(recorder);

        let summary = summarize_log(&config.data_paths.telemetry_log()).unwrap();
        assert!(summary.cost.estimated);
        // 300k estimated input tokens at 0.30 per million.
        assert!((summary.cost.total_cost - 0.09).abs() < 1e-9);
    }
}
