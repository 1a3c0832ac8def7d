//! # MindVPN CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Run the control plane; the config's `seed` section lists the fleet
//! mindvpn serve -c /etc/mindvpn/control.json
//!
//! # Render a preset (JSON map of file name to content on stdout)
//! mindvpn render xray reality_tcp -p 443 -o '{"users": [{"uuid": "..."}]}'
//!
//! # Write the rendered files into a directory
//! mindvpn render singbox hysteria2 -p 8443 --out-dir ./out
//!
//! # Check a config file, using the native binary when configured
//! MINDVPN_XRAY_BIN=/usr/local/bin/xray mindvpn validate xray ./out/config.json
//! ```

use anyhow::{anyhow, Result};
use argh::FromArgs;
use mindvpn_cli::commands::{
    apply_env_overrides, known_presets, load_config, parse_overrides, render_preset, write_files,
    ENV_CONFIG,
};
use mindvpn_configgen::{ConfigValidator, ValidatorConfig};
use mindvpn_control::ControlPlane;
use std::path::Path;
use std::time::Duration;

#[derive(FromArgs)]
/// MindVPN - relay fleet control core
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Render(RenderArgs),
    Validate(ValidateArgs),
}

/// Arguments for running the control plane.
///
/// Flags override the config file; the file overrides built-in defaults.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run the control plane
struct ServeArgs {
    /// path to a JSON config file
    ///
    /// Falls back to the MINDVPN_CONFIG environment variable, then defaults.
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// number of dispatch workers
    #[argh(option, long = "workers")]
    workers: Option<usize>,

    /// attempts a task gets before it fails
    #[argh(option, long = "max-retries")]
    max_retries: Option<u32>,

    /// length of one missed-heartbeat window in milliseconds
    #[argh(option, long = "heartbeat-timeout-ms")]
    heartbeat_timeout_ms: Option<u64>,

    /// agent port for node addresses registered without one
    #[argh(option, long = "agent-port")]
    agent_port: Option<u16>,

    /// seconds between fleet status log lines
    #[argh(option, long = "report-interval", default = "60")]
    report_interval_secs: u64,
}

/// Arguments for rendering a preset.
///
/// Output is a JSON object mapping file names to file contents, so it can be
/// piped to `jq`.
#[derive(FromArgs)]
#[argh(subcommand, name = "render")]
/// render proxy config files for a preset
struct RenderArgs {
    /// engine: xray or singbox
    #[argh(positional)]
    protocol: String,

    /// preset name, e.g. reality_tcp
    #[argh(positional)]
    preset: String,

    /// listen port
    #[argh(option, short = 'p', default = "443")]
    port: u16,

    /// JSON object of overrides (users, server_name, private_key, ...)
    #[argh(option, short = 'o', default = "\"{}\".into()")]
    overrides: String,

    /// write files into this directory instead of printing them
    #[argh(option, long = "out-dir")]
    out_dir: Option<String>,

    /// print only the SHA-256 digest of the rendered files
    #[argh(switch, long = "digest")]
    digest: bool,
}

/// Arguments for validating a config file.
#[derive(FromArgs)]
#[argh(subcommand, name = "validate")]
/// check a proxy config file
struct ValidateArgs {
    /// engine: xray or singbox
    #[argh(positional)]
    protocol: String,

    /// config file to check
    #[argh(positional)]
    file: String,

    /// path to the xray binary (overrides MINDVPN_XRAY_BIN)
    #[argh(option, long = "xray-bin")]
    xray_bin: Option<String>,

    /// path to the sing-box binary (overrides MINDVPN_SINGBOX_BIN)
    #[argh(option, long = "singbox-bin")]
    singbox_bin: Option<String>,

    /// validator timeout in milliseconds
    #[argh(option, long = "timeout-ms")]
    timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // render writes JSON to stdout; keep it free of log lines
    if !matches!(cli.command, Commands::Render(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::Render(args) => run_render(args),
        Commands::Validate(args) => run_validate(args).await,
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let path = args.config.or_else(|| std::env::var(ENV_CONFIG).ok());
    let mut config = load_config(path.as_deref().map(Path::new))?;
    apply_env_overrides(&mut config.validator, |key| std::env::var(key).ok());

    if let Some(workers) = args.workers {
        config.dispatch.workers = workers;
    }
    if let Some(max_retries) = args.max_retries {
        config.retry.max_retries = max_retries;
    }
    if let Some(timeout) = args.heartbeat_timeout_ms {
        config.registry.heartbeat_timeout_ms = timeout;
    }
    if let Some(port) = args.agent_port {
        config.registry.agent_port = port;
    }

    tracing::info!(
        workers = config.dispatch.workers,
        max_retries = config.retry.max_retries,
        heartbeat_timeout_ms = config.registry.heartbeat_timeout_ms,
        "Starting MindVPN control plane"
    );

    let plane = ControlPlane::with_http_agent(config);
    plane.apply_seed(&plane.config().seed)?;
    let handle = plane.start();

    let mut report = tokio::time::interval(Duration::from_secs(args.report_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = report.tick() => {
                let snapshot = plane.snapshot();
                let metrics = plane.dispatch_metrics();
                tracing::info!(
                    nodes_online = snapshot.nodes_online(),
                    nodes_offline = snapshot.nodes_offline(),
                    draining = snapshot.draining_nodes,
                    queued = snapshot.tasks.get("QUEUED"),
                    running = snapshot.tasks.get("RUNNING"),
                    dispatched = metrics.total_dispatched,
                    "Fleet status"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                tracing::info!("Shutdown requested");
                break;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn run_render(args: RenderArgs) -> Result<()> {
    let overrides = parse_overrides(&args.overrides)?;
    let rendered = render_preset(&args.protocol, &args.preset, args.port, &overrides).map_err(|e| {
        match known_presets(&args.protocol) {
            Ok(names) => anyhow!("{} (available presets: {})", e, names.join(", ")),
            Err(_) => e,
        }
    })?;

    if args.digest {
        println!("{}", rendered.digest());
        return Ok(());
    }
    match args.out_dir {
        Some(dir) => {
            for path in write_files(Path::new(&dir), &rendered)? {
                println!("{}", path.display());
            }
        }
        None => println!("{}", serde_json::to_string_pretty(&rendered)?),
    }
    Ok(())
}

async fn run_validate(args: ValidateArgs) -> Result<()> {
    let content = std::fs::read_to_string(&args.file)
        .map_err(|e| anyhow!("Failed to read {}: {}", args.file, e))?;

    let mut config = ValidatorConfig::default();
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    if args.xray_bin.is_some() {
        config.xray_binary = args.xray_bin;
    }
    if args.singbox_bin.is_some() {
        config.singbox_binary = args.singbox_bin;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }

    if ConfigValidator::new(config).validate(&args.protocol, &content).await {
        println!("valid");
        Ok(())
    } else {
        Err(anyhow!("{} is not a valid {} config", args.file, args.protocol))
    }
}
