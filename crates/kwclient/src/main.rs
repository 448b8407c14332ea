//
// main.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Connects to a kernel, runs one piece of code interactively, and prints the
//! result.

#![allow(missing_docs)]

use std::fs::File;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use kwclient::kernel_client::{ExecuteOptions, InteractiveOptions, KernelClient};
use kwclient::ClientConfig;
use log::LevelFilter;
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode, WriteLogger};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The websocket URL of the kernel's channels endpoint. Defaults to the
    /// value of `KW_ENDPOINT`.
    #[arg(short, long)]
    url: Option<String>,

    /// The path to a file containing the authentication token. Defaults to
    /// the value of `KW_TOKEN`.
    #[arg(short, long)]
    token: Option<String>,

    /// The code to execute. If omitted, the kernel's info is printed instead.
    #[arg(short, long)]
    code: Option<String>,

    /// Seconds to wait for the execution to finish. Defaults to the value of
    /// `KW_TIMEOUT_SECS`, or 30.
    #[arg(long)]
    timeout: Option<f64>,

    /// Whether the kernel may prompt for input
    #[arg(long, default_value_t = false)]
    allow_stdin: bool,

    /// The path to a log file. If specified, log output will be written to this
    /// file in addition to standard streams.
    #[arg(long)]
    log_file: Option<String>,

    /// The log level to use. Valid values are "trace", "debug", "info", "warn",
    /// and "error". If not specified, the default log level is "info", or the
    /// value of `RUST_LOG` if set.
    #[arg(short, long)]
    log_level: Option<String>,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    // Derive the log level
    let log_level = match args.log_level {
        Some(ref level) => level.to_string(),
        None => std::env::var("RUST_LOG").unwrap_or_else(|_| String::from("info")),
    };

    let log_level = match log_level.as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            println!("Invalid log level '{}'; using 'info'", log_level);
            LevelFilter::Info
        }
    };

    match args.log_file {
        Some(ref log_file) => {
            // A log file was provided; use a combined logger that writes to the
            // log file and the terminal
            let file = File::create(log_file)
                .with_context(|| format!("Failed to create log file '{}'", log_file))?;
            CombinedLogger::init(vec![
                TermLogger::new(
                    log_level,
                    Config::default(),
                    TerminalMode::Mixed,
                    ColorChoice::Auto,
                ),
                WriteLogger::new(log_level, Config::default(), file),
            ])
            .context("Failed to initialize logging")?;
        }
        None => {
            TermLogger::init(
                log_level,
                Config::default(),
                TerminalMode::Mixed,
                ColorChoice::Auto,
            )
            .context("Failed to initialize logging")?;
        }
    }
    Ok(())
}

fn client_config(args: &Args) -> anyhow::Result<ClientConfig> {
    let mut config = ClientConfig::default().from_env();

    if let Some(ref url) = args.url {
        config.endpoint = url.clone();
    }
    if config.endpoint.is_empty() {
        bail!("No kernel endpoint; pass --url or set KW_ENDPOINT");
    }

    if let Some(ref token_file) = args.token {
        let token = std::fs::read_to_string(token_file)
            .with_context(|| format!("Failed to read token file '{}'", token_file))?;
        log::trace!("Using auth token from file");
        config.token = Some(token.trim().to_string());
    }

    if let Some(secs) = args.timeout {
        config.default_timeout = if secs > 0.0 {
            Some(Duration::try_from_secs_f64(secs).context("Invalid --timeout")?)
        } else {
            None
        };
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    let config = client_config(&args)?;

    let client = KernelClient::connect(config.clone())
        .await
        .with_context(|| format!("Failed to connect to {}", config.endpoint))?;

    let info = client
        .wait_for_ready(None)
        .await
        .context("Kernel did not become ready")?;

    let Some(code) = args.code else {
        println!("{}", serde_json::to_string_pretty(&info)?);
        client.stop_channels().await;
        return Ok(());
    };

    // Ctrl-C abandons an open prompt and interrupts the kernel
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl-C");
            signal_cancel.cancel();
        }
    });

    let options = InteractiveOptions {
        execute: ExecuteOptions {
            allow_stdin: args.allow_stdin,
            ..ExecuteOptions::default()
        },
        timeout: config.default_timeout,
        cancel: Some(cancel),
    };

    // Default hooks: console output, terminal prompts
    let result = client.execute_interactive(&code, options, None, None).await;
    client.stop_channels().await;

    let reply = result.context("Execution failed")?;
    let status = reply
        .content
        .get("status")
        .and_then(|status| status.as_str())
        .unwrap_or("unknown");
    log::info!("Execution finished with status '{}'", status);
    if status != "ok" {
        std::process::exit(1);
    }
    Ok(())
}
