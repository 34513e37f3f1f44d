mod capabilities;
mod config;
mod error;
mod events;
mod fixer;
mod providers;
mod supervisor;
mod terminal;
mod watcher;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{ConfigManager, HealConfig, CONFIG_FILE_NAME};
use error::HealError;
use events::{EventLogger, LogCategory};
use fixer::{BatchFixer, FixOptions};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use supervisor::ProcessSupervisor;
use terminal::TerminalConsole;
use tokio::sync::mpsc;
use tracing::{error, info};
use watcher::backup::BackupStore;
use watcher::healer::PatchApplier;
use watcher::{CycleOutcome, ErrorDetector, Healer, HealerConfig, LogMonitor, WatchLoop};

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(
    name = "healwatch",
    version,
    about = "Supervise servers, catch their errors and patch them with operator approval"
)]
struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (defaults to ./healwatch.toml, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the servers and watch them (default)
    Run {
        /// Gemini model name or 'auto'
        #[arg(long)]
        model: Option<String>,
        /// Watch without launching the configured servers
        #[arg(long)]
        no_start: bool,
    },
    /// Run one detection cycle and report what it finds
    Check,
    /// Run a command repeatedly, patching the failing file between attempts
    Fix {
        /// Command to run, e.g. "python3 -m pytest"
        #[arg(long)]
        command: String,
        #[arg(long, default_value_t = 5)]
        max_attempts: u32,
        /// Seconds to wait for the command
        #[arg(long, default_value_t = 180)]
        timeout: u64,
        #[arg(long, default_value = "auto")]
        model: String,
        /// Apply fixes without asking
        #[arg(long)]
        yes: bool,
    },
    /// Write or read the category event logs
    Log {
        #[command(subcommand)]
        action: LogAction,
    },
    /// Show which optional capabilities are usable on this host
    Capabilities,
    /// Write a default configuration file
    Init {
        /// Destination (defaults to ./healwatch.toml)
        path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum LogAction {
    /// Append one event record
    Write {
        #[arg(value_enum)]
        category: LogCategory,
        #[arg(long)]
        component: Option<String>,
        #[arg(long)]
        event_type: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        message: Option<String>,
        /// Extra key=value fields
        #[arg(long = "field", value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Show the last records of a category
    Tail {
        #[arg(value_enum)]
        category: LogCategory,
        #[arg(short = 'n', long, default_value_t = 10)]
        lines: usize,
    },
    /// Show the logging directory and its files
    Status,
}

fn parse_field(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

/// JSON envelope for non-interactive output
fn json_output(success: bool, data: Value, error: Option<&str>) -> String {
    serde_json::json!({
        "success": success,
        "data": data,
        "error": error,
    })
    .to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Check for --json flag before initializing logging
    let json_mode = std::env::args().any(|arg| arg == "--json");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("healwatch=info"));

    if json_mode {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    } else if std::env::var("HEALWATCH_LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }

    let cli = Cli::parse();
    let json = cli.json;

    if let Err(e) = run_command(cli).await {
        let code = e
            .downcast_ref::<HealError>()
            .map(HealError::exit_code)
            .unwrap_or(1);
        if json {
            println!("{}", json_output(false, Value::Null, Some(&format!("{:#}", e))));
        } else {
            eprintln!("Error: {:#}", e);
        }
        std::process::exit(code);
    }
    Ok(())
}

// ============================================================================
// Command Runner
// ============================================================================

async fn run_command(cli: Cli) -> Result<()> {
    let command = cli.command.unwrap_or(Commands::Run {
        model: None,
        no_start: false,
    });

    if let Commands::Init { path } = &command {
        let path = path.clone().unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME));
        ConfigManager::write_default(&path)?;
        if cli.json {
            println!("{}", json_output(true, serde_json::json!({ "path": path }), None));
        } else {
            println!("Wrote default configuration to {}", path.display());
        }
        return Ok(());
    }

    let manager = ConfigManager::load(cli.config.as_deref())?;
    if let Some(path) = manager.config_path() {
        info!(path = %path.display(), "Loaded configuration");
    }
    let config = manager.into_inner();

    match command {
        Commands::Run { model, no_start } => run_watch(config, model, !no_start).await,
        Commands::Check => run_check(config, cli.json).await,
        Commands::Fix {
            command,
            max_attempts,
            timeout,
            model,
            yes,
        } => {
            let options = FixOptions {
                command,
                max_attempts,
                timeout: Duration::from_secs(timeout),
                auto_approve: yes,
            };
            run_fix(config, options, &model, cli.json).await
        }
        Commands::Log { action } => run_log(config, action, cli.json),
        Commands::Capabilities => {
            let negotiated = capabilities::negotiate(&config, None).await;
            if cli.json {
                println!(
                    "{}",
                    json_output(true, serde_json::to_value(&negotiated.capabilities)?, None)
                );
            } else {
                negotiated.capabilities.print();
            }
            Ok(())
        }
        Commands::Init { .. } => Ok(()),
    }
}

fn build_detector(config: &HealConfig, syntax: Arc<watcher::SyntaxRegistry>) -> ErrorDetector {
    ErrorDetector::new(
        config.project_root.clone(),
        config.tracked_sources(),
        syntax,
        LogMonitor::new(config.event_log_dirs(), config.monitor.log_tail_lines),
    )
}

async fn run_watch(config: HealConfig, model: Option<String>, start_servers: bool) -> Result<()> {
    let negotiated = capabilities::negotiate(&config, model.as_deref()).await;
    negotiated.capabilities.print();

    let supervisor = Arc::new(ProcessSupervisor::new(
        config.log_dir(),
        config.monitor.stop_grace(),
    )?);
    for server in &config.servers {
        let cwd = server.cwd.as_ref().map(|dir| config.resolve(dir));
        supervisor
            .register(&server.name, server.argv()?, cwd, server.port)
            .await?;
    }

    if start_servers {
        let started = supervisor.start_all().await;
        if !started.changed.is_empty() {
            println!("[SUPERVISOR] Started: {}", started.changed.join(", "));
        }
        for (name, reason) in &started.failed {
            eprintln!("[SUPERVISOR] Failed to start {}: {}", name, reason);
        }
    }

    let detector = Arc::new(build_detector(&config, negotiated.syntax.clone()));
    println!(
        "[DETECTOR] Watching {} source file(s) every {}s",
        detector.sources().len(),
        config.monitor.poll_interval().as_secs()
    );

    let applier = PatchApplier::new(
        BackupStore::new(config.backup_dir()),
        negotiated.syntax.clone(),
    );
    let healer = Healer::new(
        HealerConfig {
            history_limit: config.monitor.history_limit,
        },
        supervisor.clone(),
        negotiated.patch_client.map(Arc::new),
        applier,
    );

    let interrupt_supervisor = supervisor.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\n[SUPERVISOR] Interrupted, stopping all servers...");
            interrupt_supervisor.stop_all().await;
            std::process::exit(130);
        }
    });

    let (tx, mut rx) = mpsc::channel(1);
    let watch = tokio::spawn(
        WatchLoop::new(
            detector,
            supervisor.clone(),
            healer.busy_flag(),
            config.monitor.poll_interval(),
        )
        .run(tx),
    );

    let mut console = TerminalConsole;
    while let Some(errors) = rx.recv().await {
        match healer.handle(errors, &mut console).await {
            Ok(CycleOutcome::Quit) => break,
            Ok(outcome) => info!(?outcome, "Fix cycle finished"),
            Err(e) => error!(error = %e, "Fix cycle failed"),
        }
    }

    watch.abort();
    supervisor.stop_all().await;

    let stats = healer.stats();
    println!(
        "[SUPERVISOR] Shut down. Errors detected: {}, fixes applied: {}",
        stats.errors_detected, stats.fixes_applied
    );
    Ok(())
}

async fn run_check(config: HealConfig, json: bool) -> Result<()> {
    let negotiated = capabilities::negotiate(&config, None).await;
    let detector = build_detector(&config, negotiated.syntax);
    let errors = detector.scan(None).await;

    if json {
        println!("{}", json_output(true, serde_json::to_value(&errors)?, None));
    } else if errors.is_empty() {
        println!("[DETECTOR] No errors in {} source file(s).", detector.sources().len());
    } else {
        for e in &errors {
            let location = match (&e.source_file, e.line) {
                (Some(file), Some(line)) => format!(" {}:{}", detector.display_path(file), line),
                (Some(file), None) => format!(" {}", detector.display_path(file)),
                _ => String::new(),
            };
            println!(
                "[DETECTOR] {:<8} {}{} {}",
                e.severity.to_string().to_uppercase(),
                e.kind,
                location,
                e.message
            );
        }
    }

    if watcher::select_for_handling(&errors).is_some() {
        std::process::exit(1);
    }
    Ok(())
}

async fn run_fix(config: HealConfig, options: FixOptions, model: &str, json: bool) -> Result<()> {
    let negotiated = capabilities::negotiate(&config, Some(model)).await;
    let root = config
        .project_root
        .canonicalize()
        .with_context(|| format!("Project root {} not found", config.project_root.display()))?;
    let applier = PatchApplier::new(BackupStore::new(config.backup_dir()), negotiated.syntax);

    let fixer = BatchFixer::new(root, negotiated.patch_client, applier, options);
    let code = fixer.run(&mut TerminalConsole).await?;

    if json {
        println!(
            "{}",
            json_output(code == 0, serde_json::json!({ "exit_code": code }), None)
        );
    }
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn run_log(config: HealConfig, action: LogAction, json: bool) -> Result<()> {
    let logger = EventLogger::new(config.log_dir())?;

    match action {
        LogAction::Write {
            category,
            component,
            event_type,
            description,
            message,
            fields,
        } => {
            let extra: Map<String, Value> = fields
                .into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect();
            let required = |value: Option<String>, flag: &str| {
                value.ok_or_else(|| {
                    HealError::Configuration(format!(
                        "--{} is required for {} events",
                        flag,
                        category.as_str()
                    ))
                })
            };

            let entry = match category {
                LogCategory::Sensor => logger.log_sensor_event(
                    &required(event_type, "event-type")?,
                    &required(description, "description")?,
                    extra,
                )?,
                LogCategory::Error => logger.log_error_event(
                    &required(component, "component")?,
                    &required(message, "message")?,
                    extra,
                )?,
                LogCategory::Data => logger.log_data_event(
                    &required(component, "component")?,
                    &required(event_type, "event-type")?,
                    &required(description, "description")?,
                    extra,
                )?,
            };

            if json {
                println!("{}", json_output(true, serde_json::to_value(&entry)?, None));
            } else {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        LogAction::Tail { category, lines } => {
            let entries = logger.tail(category, lines)?;
            if json {
                println!("{}", json_output(true, serde_json::to_value(&entries)?, None));
            } else {
                for entry in &entries {
                    println!("{}", serde_json::to_string(entry)?);
                }
            }
        }
        LogAction::Status => {
            let status = logger.status();
            if json {
                println!("{}", json_output(true, serde_json::to_value(&status)?, None));
            } else {
                println!("Log directory: {}", status.log_dir.display());
                for file in &status.files {
                    println!("  {}", file);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults_to_run() {
        let cli = Cli::try_parse_from(["healwatch"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.json);
    }

    #[test]
    fn test_fix_defaults() {
        let cli = Cli::try_parse_from(["healwatch", "fix", "--command", "python3 app.py"]).unwrap();
        match cli.command {
            Some(Commands::Fix {
                max_attempts,
                timeout,
                model,
                yes,
                ..
            }) => {
                assert_eq!(max_attempts, 5);
                assert_eq!(timeout, 180);
                assert_eq!(model, "auto");
                assert!(!yes);
            }
            _ => panic!("expected fix"),
        }
    }

    #[test]
    fn test_log_write_parses_fields() {
        let cli = Cli::try_parse_from([
            "healwatch",
            "--json",
            "log",
            "write",
            "error",
            "--component",
            "sensor",
            "--message",
            "boom",
            "--field",
            "sensor_id=T1",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Some(Commands::Log {
                action:
                    LogAction::Write {
                        category, fields, ..
                    },
            }) => {
                assert_eq!(category, LogCategory::Error);
                assert_eq!(fields, vec![("sensor_id".to_string(), "T1".to_string())]);
            }
            _ => panic!("expected log write"),
        }
    }

    #[test]
    fn test_parse_field_rejects_bare_words() {
        assert!(parse_field("novalue").is_err());
        assert!(parse_field("=x").is_err());
        assert_eq!(parse_field("a=b=c").unwrap(), ("a".into(), "b=c".into()));
    }

    #[test]
    fn test_json_envelope() {
        let out: Value = serde_json::from_str(&json_output(false, Value::Null, Some("bad"))).unwrap();
        assert_eq!(out["success"], false);
        assert_eq!(out["error"], "bad");
    }
}
