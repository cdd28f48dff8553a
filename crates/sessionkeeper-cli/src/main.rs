//! Sessionkeeper - a terminal front-end for an authenticated backend session.
//!
//! Signs in against the identity provider, keeps the credentials in the
//! configured store, and issues authenticated requests that transparently
//! refresh expired access secrets.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use sessionkeeper_core::api::{HttpIdentityProvider, HttpTransport};
use sessionkeeper_core::{ApiError, AuthenticatedClient, Config, SessionManager, SystemClock};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Environment variable holding the login password (skips the prompt)
const ENV_PASSWORD: &str = "SESSIONKEEPER_PASSWORD";

/// Log file prefix inside the cache directory
const LOG_FILE_PREFIX: &str = "sessionkeeper.log";

const USAGE: &str = "\
Usage: sessionkeeper <command>

Commands:
  login [identifier]   Sign in and store credentials
  whoami               Show the signed-in user
  status               Show session and credential status
  refresh              Renew the access secret now
  get <path>           Fetch an authenticated resource
  logout               Revoke and clear stored credentials";

/// Initialize the tracing subscriber for logging.
///
/// Stderr gets whatever `RUST_LOG` allows (default `warn`); the rolling file
/// in the cache directory always records `info` and above.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_filter(filter);

    match config.cache_dir() {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new("info"));
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry().with(stderr_layer).init();
            None
        }
    }
}

fn build_session(config: &Config) -> Result<SessionManager> {
    let store = config.credential_store()?;
    let provider = HttpIdentityProvider::new(config).context("Failed to create identity provider client")?;
    Ok(
        SessionManager::new(store, Arc::new(provider), Arc::new(SystemClock))
            .with_expiry_leeway(config.expiry_leeway_secs),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load()?;
    let _log_guard = init_tracing(&config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let session = build_session(&config)?;
    info!(command, storage = ?config.storage, "Sessionkeeper starting");

    match command {
        "login" => login(&session, &mut config, args.get(1).cloned()).await,
        "whoami" => whoami(&session).await,
        "status" => status(&session).await,
        "refresh" => refresh(&session).await,
        "get" => {
            let path = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("get requires a path\n\n{}", USAGE))?;
            get(&session, &config, path).await
        }
        "logout" => logout(&session).await,
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => Err(anyhow::anyhow!("Unknown command: {}\n\n{}", other, USAGE)),
    }
}

async fn login(session: &SessionManager, config: &mut Config, identifier: Option<String>) -> Result<()> {
    let identifier = match identifier.or_else(|| config.last_identifier.clone()) {
        Some(identifier) => identifier,
        None => prompt_identifier()?,
    };
    let secret = match std::env::var(ENV_PASSWORD) {
        Ok(secret) => secret,
        Err(_) => rpassword::prompt_password("Password: ")?,
    };

    let identity = session
        .login(&identifier, &secret)
        .await
        .with_context(|| format!("Login failed for {}", identifier))?;

    config.last_identifier = Some(identifier);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Signed in as {} ({})", identity.subject, identity.role);
    Ok(())
}

fn prompt_identifier() -> Result<String> {
    print!("Email: ");
    io::stdout().flush()?;

    let mut identifier = String::new();
    io::stdin().read_line(&mut identifier)?;
    Ok(identifier.trim().to_string())
}

async fn whoami(session: &SessionManager) -> Result<()> {
    session.bootstrap().await;
    match session.current_user() {
        Some(user) => {
            println!("{}", user.subject);
            Ok(())
        }
        None => Err(anyhow::anyhow!("Not signed in. Run `sessionkeeper login`.")),
    }
}

async fn status(session: &SessionManager) -> Result<()> {
    session.bootstrap().await;
    let state = session.state();
    println!("{}", serde_json::to_string_pretty(&state)?);
    if let Some(expiry) = state.user.as_ref().and_then(|u| u.expiry_time()) {
        println!("Access secret expires at {}", expiry);
    }
    Ok(())
}

async fn refresh(session: &SessionManager) -> Result<()> {
    if session.refresh().await {
        println!("Credentials refreshed");
        Ok(())
    } else {
        Err(anyhow::anyhow!("Refresh failed; you have been signed out"))
    }
}

async fn get(session: &SessionManager, config: &Config, path: &str) -> Result<()> {
    session.bootstrap().await;
    if session.current_user().is_none() {
        return Err(anyhow::anyhow!("Not signed in. Run `sessionkeeper login`."));
    }
    session.ensure_fresh().await;

    let transport = HttpTransport::new(config).context("Failed to create HTTP client")?;
    let client = AuthenticatedClient::new(session.clone(), Arc::new(transport));

    match client.send(sessionkeeper_core::ApiRequest::get(path)).await {
        Ok(response) => {
            match serde_json::from_str::<serde_json::Value>(&response.body) {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                Err(_) => println!("{}", response.body),
            }
            Ok(())
        }
        Err(ApiError::Unauthorized) => Err(anyhow::anyhow!(
            "Session expired. Run `sessionkeeper login` to sign in again."
        )),
        Err(e) => Err(e.into()),
    }
}

async fn logout(session: &SessionManager) -> Result<()> {
    session.sign_out().await;
    println!("Signed out");
    Ok(())
}
