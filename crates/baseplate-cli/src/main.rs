//! `baseplate` – BasePlate OS entry point.
//!
//! Boots the asset OS from a configuration file and runs until signalled:
//!
//! ```text
//! baseplate [config.json] [--check]
//! ```
//!
//! With `--check` the host boots, runs one system check over the bus,
//! prints the per-module results, and shuts down again.
//!
//! Exit codes: 0 on orderly shutdown, 1 on any boot failure (the fatal log
//! line names the phase and the offending module), 2 on bad usage.

mod heartbeat;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use colored::Colorize;
use serde_json::{json, Value};
use tracing::error;

use baseplate_kernel::{ModuleRegistry, RegistryLayer};
use baseplate_runtime::OsManager;

use heartbeat::HeartbeatFactory;

fn main() -> ExitCode {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG drives the filter (default "info"); BASEPLATE_LOG_FORMAT=json
    // switches to newline-delimited JSON for log aggregators. User-facing
    // output below still uses println! for UX consistency.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("BASEPLATE_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    // ── Arguments ─────────────────────────────────────────────────────────
    let mut config_path: Option<PathBuf> = None;
    let mut check_mode = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--check" => check_mode = true,
            "--help" | "-h" => {
                println!("Usage: baseplate [config.json] [--check]");
                return ExitCode::SUCCESS;
            }
            flag if flag.starts_with('-') => {
                eprintln!("Unknown option: {flag}");
                eprintln!("Usage: baseplate [config.json] [--check]");
                return ExitCode::from(2);
            }
            path => config_path = Some(PathBuf::from(path)),
        }
    }
    let config_path = config_path.unwrap_or_else(|| PathBuf::from("config.json"));

    print_banner();

    // ── Registry ──────────────────────────────────────────────────────────
    // The user layer is the embedder's extension point; the bundled modules
    // live in the builtin layer and can be overridden by name.
    let registry = ModuleRegistry::new()
        .push_layer(RegistryLayer::new("user"))
        .push_layer(RegistryLayer::new("builtin").register(HeartbeatFactory));

    let os = match OsManager::from_config_path(&config_path, registry) {
        Ok(os) => os,
        Err(e) => {
            error!(config = %config_path.display(), error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    // ── Boot ──────────────────────────────────────────────────────────────
    if let Err(e) = os.boot() {
        error!(
            phase = e.phase.as_str(),
            module = e.source.module(),
            error = %e.source,
            "boot failed"
        );
        println!("{} boot failed during {}: {}", "✗".red().bold(), e.phase, e.source);
        return ExitCode::FAILURE;
    }
    println!(
        "  {} Boot complete. Modules: {}",
        "✓".green().bold(),
        os.loader().module_names().join(", ").bold()
    );

    if check_mode {
        run_self_check(&os);
        os.shutdown();
        return ExitCode::SUCCESS;
    }

    // ── Main loop ─────────────────────────────────────────────────────────
    println!("  Running. Press {} to shut down.\n", "Ctrl-C".bold());
    os.run();
    println!("  {} BasePlate OS halted.", "✓".green());
    ExitCode::SUCCESS
}

/// Drive one system check through the reserved bus topics and print the
/// per-module results.
fn run_self_check(os: &OsManager) {
    os.wire_reserved_topics();

    let response: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let sink = response.clone();
    let bus = os.bus();
    bus.subscribe("system.check.response", move |payload| {
        *sink.lock().unwrap() = Some(payload.clone());
        Ok(())
    });

    let request_id = uuid::Uuid::new_v4().to_string();
    // Delivery is synchronous; the response is recorded before this returns.
    bus.publish("system.check.request", json!({ "request_id": request_id }));

    let response = response.lock().unwrap();
    let Some(response) = response.as_ref() else {
        println!("  {} No system check response received.", "✗".red().bold());
        return;
    };

    let overall = response["results"]["overall_healthy"].as_bool().unwrap_or(false);
    println!();
    if overall {
        println!("  Overall health: {}", "HEALTHY".green().bold());
    } else {
        println!("  Overall health: {}", "UNHEALTHY".red().bold());
    }

    if let Some(modules) = response["results"]["modules"].as_object() {
        for (name, report) in modules {
            let healthy = report["healthy"].as_bool().unwrap_or(false);
            let status = report["status"].as_str().unwrap_or("unknown");
            let icon = if healthy { "✓".green() } else { "✗".red() };
            println!("    {icon} {name:<15} {status}");
        }
    }
    println!();
}

fn print_banner() {
    println!();
    println!("{}", r#"   ___                ___  __     __       "#.bold().cyan());
    println!("{}", r#"  / _ )___ ____ ___  / _ \/ /__ _/ /____   "#.bold().cyan());
    println!("{}", r#" / _  / _ `(_-</ -_)/ ___/ / _ `/ __/ -_)  "#.bold().cyan());
    println!("{}", r#"/____/\_,_/___/\__//_/  /_/\_,_/\__/\__/   "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "BasePlate".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Asset Operating System");
    println!();
}
