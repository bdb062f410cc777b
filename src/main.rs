//! Secure Relay - mutual-TLS command gateway

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use secure_relay::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    mtls::{BundleDecoder, CertSummary, Pkcs12Decoder},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Inspect {
            ref file,
            ref password,
            json,
        }) => match run_inspect(file, password, json) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("❌ {e:#}");
                ExitCode::FAILURE
            }
        },
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Decode a bundle and print its certificate chain
fn run_inspect(file: &Path, password: &str, json: bool) -> anyhow::Result<()> {
    let bundle =
        std::fs::read(file).with_context(|| format!("cannot read {}", file.display()))?;
    let material = Pkcs12Decoder
        .decode(&bundle, password)
        .with_context(|| format!("cannot decode {}", file.display()))?;
    let chain = CertSummary::from_pem_chain(material.cert_chain_pem())
        .context("cannot summarize certificate chain")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&chain)?);
        return Ok(());
    }

    println!("✅ {} decoded ({} certificate(s))\n", file.display(), chain.len());
    for (i, cert) in chain.iter().enumerate() {
        let role = if i == 0 { "leaf" } else { "chain" };
        println!("[{i}] {role}");
        println!("   Subject:    {}", cert.subject);
        println!("   Issuer:     {}", cert.issuer);
        println!("   Serial:     {}", cert.serial);
        println!("   Not before: {}", cert.not_before);
        println!("   Not after:  {}", cert.not_after);
        println!();
    }
    Ok(())
}

async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        auth_mode = %config.auth.mode,
        default_env = ?config.upstream.default_env,
        "Starting Secure Relay"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Relay error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Relay shutdown complete");
    ExitCode::SUCCESS
}
