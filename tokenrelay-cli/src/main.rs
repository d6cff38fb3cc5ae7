//! Tokenrelay CLI
//!
//! Command-line client for a bearer-token API that keeps the session
//! alive across access-token expiry.
//!
//! # Usage
//!
//! ```bash
//! # Sign in and store the issued tokens in the OS keyring
//! tokenrelay login --email ada@example.com --password hunter2
//!
//! # Call the API; a 401 refreshes the session once and replays
//! tokenrelay request GET /profile
//! tokenrelay request POST /notes --data '{"text": "hi"}'
//!
//! # Inspect or drop the session
//! tokenrelay status
//! tokenrelay logout
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokenrelay_core::{create_store, ApiClient, ApiRequest, ClientError, Method, SecretStore};
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

mod config;

#[derive(Parser)]
#[command(name = "tokenrelay")]
#[command(about = "Bearer-token API client with automatic session refresh")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured API base URL
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the issued tokens
    Login {
        #[arg(short, long)]
        email: Option<String>,

        #[arg(short, long)]
        password: Option<String>,

        /// Raw JSON sign-in body, used instead of --email/--password
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Forget the stored tokens
    Logout,

    /// Show the stored session
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Refresh the session now
    Refresh,

    /// Send an authorized request
    Request {
        /// HTTP method (GET, POST, PUT, DELETE, ...)
        method: String,

        /// Path relative to the base URL, or an absolute URL
        path: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Store tokens obtained elsewhere
    SetTokens {
        access_token: String,

        refresh_token: String,

        /// Access-token lifetime in seconds
        #[arg(short, long, default_value_t = 900)]
        expires_in: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(cli.config.as_deref())?;
    init_logging(&config.log_level, cli.verbose);
    debug!("Loaded configuration from {:?}", config.config_path);

    if let Some(base_url) = &cli.base_url {
        config.client.base_url = base_url
            .parse()
            .with_context(|| format!("Invalid base URL {:?}", base_url))?;
    }

    let store: Arc<dyn SecretStore> = Arc::from(create_store(config.prefer_keyring));
    let client = ApiClient::new(config.client, store).context("Failed to build API client")?;

    match cli.command {
        Commands::Login { email, password, data } => {
            login(&client, email, password, data.as_deref()).await
        }
        Commands::Logout => logout(&client).await,
        Commands::Status { format } => status(&client, &format).await,
        Commands::Refresh => refresh(&client).await,
        Commands::Request { method, path, data } => {
            send_request(&client, &method, &path, data.as_deref()).await
        }
        Commands::SetTokens { access_token, refresh_token, expires_in } => {
            set_tokens(&client, &access_token, &refresh_token, expires_in).await
        }
    }
}

fn init_logging(level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("Invalid JSON body: {}", raw))
}

fn sign_in_body(email: Option<String>, password: Option<String>, data: Option<&str>) -> Result<Value> {
    if let Some(raw) = data {
        return parse_json(raw);
    }
    match (email, password) {
        (Some(email), Some(password)) => Ok(json!({ "email": email, "password": password })),
        _ => bail!("login needs --email and --password, or --data"),
    }
}

/// Turn a lost session into an actionable message.
fn explain(err: ClientError) -> anyhow::Error {
    if err.is_session_expired() {
        anyhow!("{}\nSession is no longer valid; run `tokenrelay login`.", err)
    } else {
        err.into()
    }
}

async fn login(
    client: &ApiClient,
    email: Option<String>,
    password: Option<String>,
    data: Option<&str>,
) -> Result<()> {
    let body = sign_in_body(email, password, data)?;
    client.sign_in(body).await.context("Sign-in failed")?;

    println!("Signed in to {}", client.config().base_url);
    if let Some(expires_at) = client.credentials().access_expires_at().await {
        println!("  Access token expires at {}", expires_at.to_rfc3339());
    }
    Ok(())
}

async fn logout(client: &ApiClient) -> Result<()> {
    client.sign_out().await;
    println!("Signed out");
    Ok(())
}

async fn status(client: &ApiClient, format: &str) -> Result<()> {
    let credentials = client.credentials();
    let snapshot = credentials.snapshot().await;
    let signed_in = snapshot.access_token.is_some();
    let expired = credentials.is_expired().await;
    let expires_at = snapshot.access_expires_at.map(|t| t.to_rfc3339());

    match format {
        "json" => {
            let report = json!({
                "base_url": client.config().base_url.as_str(),
                "signed_in": signed_in,
                "has_refresh_token": snapshot.refresh_token.is_some(),
                "access_expires_at": expires_at,
                "expired": expired,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => {
            println!("API: {}", client.config().base_url);
            if !signed_in {
                println!("  Not signed in");
                return Ok(());
            }
            match expires_at {
                Some(at) if expired => println!("  Access token expired at {}", at),
                Some(at) => println!("  Access token valid until {}", at),
                None => println!("  Access token expiry unknown"),
            }
            if snapshot.refresh_token.is_none() {
                println!("  No refresh token stored");
            }
        }
    }
    Ok(())
}

async fn refresh(client: &ApiClient) -> Result<()> {
    client.refresh_now().await.map_err(explain)?;

    match client.credentials().access_expires_at().await {
        Some(at) => println!("Session refreshed, valid until {}", at.to_rfc3339()),
        None => println!("Session refreshed"),
    }
    Ok(())
}

async fn send_request(client: &ApiClient, method: &str, path: &str, data: Option<&str>) -> Result<()> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method {:?}", method))?;

    let mut request = ApiRequest::new(method, path);
    if let Some(raw) = data {
        request = request.json(parse_json(raw)?);
    }

    let response = client.request(request).await.map_err(explain)?;
    debug!("{} response", response.status);

    match response.json::<Value>() {
        Ok(body) => println!("{}", serde_json::to_string_pretty(&body)?),
        Err(_) => println!("{}", response.body),
    }
    Ok(())
}

async fn set_tokens(
    client: &ApiClient,
    access_token: &str,
    refresh_token: &str,
    expires_in: i64,
) -> Result<()> {
    client
        .set_tokens(access_token, refresh_token, expires_in)
        .await
        .context("Failed to store tokens")?;
    println!("Tokens stored");
    Ok(())
}
