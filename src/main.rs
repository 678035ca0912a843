//! Certificate authentication gateway
//!
//! Reverse-proxy sub-request target that exchanges TLS client certificates
//! for signed security tokens.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::runtime::Handle;
use tracing::{error, info};

use certauth_gateway::{
    cli::{Cli, Command},
    client::SecurityClient,
    config::Config,
    coordinator::{AuthState, AuthVariables, Operation},
    gateway::Gateway,
    mtls::Identity,
    setup_tracing,
    token::{UserInfo, UserJson, build_proxy_token_request, build_token_request},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
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

    let result = match cli.command {
        Some(Command::Check { cert, operations }) => run_check(&config, &cert, &operations).await,
        Some(Command::SignRequest {
            subject,
            issuer,
            proxy,
        }) => run_sign_request(&config, subject, issuer, proxy),
        Some(Command::Serve) | None => run_server(config).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the auth endpoint
async fn run_server(config: Config) -> anyhow::Result<ExitCode> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        routes = config.routes.len(),
        "Starting certauth gateway"
    );

    let gateway = Gateway::new(config).context("Failed to create gateway")?;
    gateway.run().await.context("Gateway error")?;

    info!("Gateway shutdown complete");
    Ok(ExitCode::SUCCESS)
}

/// Authenticate one certificate with the final-result fetch path
async fn run_check(
    config: &Config,
    cert: &std::path::Path,
    operations: &[Operation],
) -> anyhow::Result<ExitCode> {
    let pem = std::fs::read(cert).with_context(|| format!("Failed to read {}", cert.display()))?;
    let identity = Identity::from_pem(&pem).context("Failed to parse certificate")?;
    let operations = Command::check_operations(operations);
    info!(identity = %identity, ?operations, "Checking certificate");

    let client = SecurityClient::from_config(&config.security, Handle::current())
        .context("Failed to configure security client")?;
    client
        .initialize()
        .context("Failed to initialize security client")?;

    let mut vars = AuthVariables {
        remote_user: identity.subject.clone(),
        ..AuthVariables::default()
    };
    let mut state = AuthState::Passed;
    let mut reason = None;

    if operations.user_info {
        match client.fetch_user_info(&identity).await {
            Ok(UserInfo {
                token, signature, ..
            }) => {
                vars.user_info = token;
                vars.user_info_signature = signature;
            }
            Err(e) => {
                state = if e.is_authentication_failure() {
                    AuthState::Failed
                } else {
                    AuthState::Error
                };
                reason = Some(e.to_string());
            }
        }
    }
    if operations.user_json && state == AuthState::Passed {
        match client.fetch_user_json(&identity).await {
            Ok(UserJson { json, signature }) => {
                vars.user_info_json = json;
                vars.user_info_json_signature = signature;
            }
            Err(e) => {
                state = if e.is_authentication_failure() {
                    AuthState::Failed
                } else {
                    AuthState::Error
                };
                reason = Some(e.to_string());
            }
        }
    }

    let report = if state == AuthState::Passed {
        serde_json::json!({ "state": state, "variables": vars })
    } else {
        serde_json::json!({ "state": state, "reason": reason })
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(if state == AuthState::Passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Print a signed request for debugging the signing configuration
fn run_sign_request(
    config: &Config,
    subject: String,
    issuer: String,
    proxy: bool,
) -> anyhow::Result<ExitCode> {
    let client = SecurityClient::from_config(&config.security, Handle::current())
        .context("Failed to configure request signing")?;
    let identity = Identity::new(subject, issuer);

    let json = if proxy {
        serde_json::to_string_pretty(&build_proxy_token_request(&identity, client.signing_config())?)?
    } else {
        serde_json::to_string_pretty(&build_token_request(&identity, client.signing_config())?)?
    };
    println!("{json}");
    Ok(ExitCode::SUCCESS)
}
