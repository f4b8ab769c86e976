//! pisync - Entry Point
//!
//! Keeps a device's files in step with what the update server assigns to it.
//! Runs as a supervised service on edge devices (Raspberry Pi and the like).

use std::env;

use colored::Colorize;
use tracing::{error, info, warn};

use pisync::app::cli::{CliArgs, Mode, USAGE};
use pisync::app::oneshot::{check_now, list_manifest};
use pisync::app::options::AppOptions;
use pisync::app::run::run;
use pisync::diagnostics::collect_diagnostics;
use pisync::errors::{exit_code, SyncError};
use pisync::installer::setup::setup;
use pisync::logs::{init_logging, LogLevel, LogOptions};
use pisync::storage::layout::StorageLayout;
use pisync::storage::settings::Settings;
use pisync::sync::syncer::CycleReport;
use pisync::utils::version_info;

#[tokio::main]
async fn main() {
    let code = run_cli().await;
    std::process::exit(code);
}

async fn run_cli() -> i32 {
    let args = match CliArgs::parse(env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            return exit_code::CONFIGURATION;
        }
    };

    match args.mode {
        Mode::Help => {
            print!("{}", USAGE);
            return exit_code::OK;
        }
        Mode::Version => {
            return match serde_json::to_string_pretty(&version_info()) {
                Ok(version) => {
                    println!("{}", version);
                    exit_code::OK
                }
                Err(e) => {
                    eprintln!("{}", e);
                    exit_code::FAILURE
                }
            };
        }
        _ => {}
    }

    let layout = args
        .config_dir
        .clone()
        .map(StorageLayout::new)
        .unwrap_or_default();

    if args.mode == Mode::Setup {
        let _guard = init_logging(LogOptions {
            log_level: LogLevel::Warn,
            ..Default::default()
        });
        return report_failure(setup(&layout, &args).await);
    }

    // Retrieve the settings file
    let mut settings = match Settings::load(&layout.settings_file()).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to load settings: {}", e);
            return e.exit_code();
        }
    };
    if let Err(e) = args.apply_overrides(&mut settings) {
        eprintln!("{}", e);
        return e.exit_code();
    }
    if args.key.is_some() {
        eprintln!("--key is only used together with --setup; ignoring it");
    }

    // Initialize logging; the guard flushes the file sink when dropped
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: match args.mode {
            Mode::Serve => settings.log_dir.clone(),
            _ => None,
        },
        json_format: settings.json_logs,
        ..Default::default()
    };
    let _guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = AppOptions::from_settings(&settings, layout.clone());
    match args.mode {
        Mode::Diagnostic => {
            let report = collect_diagnostics(&layout, &settings).await;
            match serde_json::to_string_pretty(&report) {
                Ok(report) => {
                    println!("{}", report);
                    exit_code::OK
                }
                Err(e) => report_failure(Err(e.into())),
            }
        }
        Mode::List => match list_manifest(&options).await {
            Ok(manifest) => {
                println!("{} file(s) assigned to this device", manifest.len());
                for entry in manifest.entries() {
                    println!(
                        "  {:<40} {:>12} bytes  {}",
                        entry.file_name,
                        entry.size,
                        &entry.hash[..12.min(entry.hash.len())]
                    );
                }
                exit_code::OK
            }
            Err(e) => report_failure(Err(e)),
        },
        Mode::CheckNow => match check_now(&options, args.file.as_deref()).await {
            Ok(report) => print_report(&report),
            Err(e) => report_failure(Err(e)),
        },
        _ => {
            info!("Running pisync {} with options: {:?}", version_info().version, options);
            match run(options, await_shutdown_signal()).await {
                Ok(()) => exit_code::OK,
                Err(e) => {
                    error!("pisync stopped: {e}");
                    e.exit_code()
                }
            }
        }
    }
}

fn report_failure(result: Result<(), SyncError>) -> i32 {
    match result {
        Ok(()) => exit_code::OK,
        Err(e) => {
            eprintln!("{} {} ({})", "[ERROR]".red().bold(), e, e.kind());
            e.exit_code()
        }
    }
}

fn print_report(report: &CycleReport) -> i32 {
    for applied in &report.applied {
        println!(
            "{} {} ({} bytes)",
            "[UPDATED]".green().bold(),
            applied.file_name,
            applied.bytes
        );
    }
    for failed in &report.failed {
        println!(
            "{} {}: {} ({}, attempt {})",
            "[FAILED]".red().bold(),
            failed.file_name,
            failed.message,
            failed.kind,
            failed.attempts
        );
    }
    for pruned in &report.pruned {
        println!("{} {}", "[REMOVED]".yellow().bold(), pruned);
    }
    println!(
        "{} file(s) in manifest, {} up to date, {} updated, {} failed",
        report.manifest_files,
        report.unchanged,
        report.applied.len(),
        report.failed.len()
    );

    if report.is_clean() {
        exit_code::OK
    } else {
        exit_code::FAILURE
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                }
                return;
            }
            _ => warn!("Unable to install signal handlers, falling back to Ctrl+C"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Ctrl+C received, shutting down...");
}
