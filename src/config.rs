use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{Confirm, Input, Password};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::delivery::DEFAULT_ENDPOINT;
use crate::orchestrator::OrchestratorOptions;
use crate::token::CredentialTarget;

/// Session Relay - keeps a session credential in sync with a collector
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Control API host address
    #[arg(short = 'H', long, env = "SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Control API port
    #[arg(short, long, env = "SERVER_PORT", default_value = "8790")]
    pub port: u16,

    /// Key required by the control API
    #[arg(short = 'k', long, env = "CONTROL_API_KEY")]
    pub api_key: Option<String>,

    /// Path to the relay state database
    #[arg(short = 'd', long, env = "STATE_DB_FILE")]
    pub db_file: Option<String>,

    /// File the host writes the current credential value to
    #[arg(short = 'c', long, env = "CREDENTIAL_FILE")]
    pub credential_file: Option<String>,

    /// Domain the watched credential belongs to
    #[arg(long, env = "TARGET_DOMAIN", default_value = "instagram.com")]
    pub domain: String,

    /// Name of the watched credential
    #[arg(long, env = "CREDENTIAL_NAME", default_value = "sessionid")]
    pub credential_name: String,

    /// Poll interval in seconds
    #[arg(long, env = "POLL_INTERVAL", default_value = "300")]
    pub poll_interval: u64,

    /// Collector endpoint, written to the state store at start-up
    #[arg(long, env = "RELAY_ENDPOINT")]
    pub relay_endpoint: Option<String>,

    /// Collector auth token, written to the state store at start-up
    #[arg(long, env = "RELAY_AUTH_TOKEN")]
    pub relay_auth_token: Option<String>,

    /// Delivery request timeout in seconds
    #[arg(long, env = "DELIVERY_TIMEOUT", default_value = "30")]
    pub delivery_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    // Control API
    pub server_host: String,
    pub server_port: u16,
    pub control_api_key: String,

    // Storage
    pub state_db_file: PathBuf,
    pub credential_file: PathBuf,

    // Watched credential
    pub target_domain: String,
    pub credential_name: String,
    pub poll_interval: u64,

    // Relay settings seeded into the store
    pub relay_endpoint: Option<String>,
    pub relay_auth_token: Option<String>,

    // HTTP client
    pub http_connect_timeout: u64,
    pub delivery_timeout: u64,

    // Logging
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        Self::from_args(args)
    }

    fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            server_host: args.host,
            server_port: args.port,

            control_api_key: args
                .api_key
                .or_else(|| std::env::var("CONTROL_API_KEY").ok())
                .filter(|k| !k.is_empty())
                .context("CONTROL_API_KEY is required (use -k or set CONTROL_API_KEY env var)")?,

            state_db_file: args
                .db_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(|| default_data_dir().join("state.sqlite3")),

            credential_file: args
                .credential_file
                .map(|s| expand_tilde(&s))
                .unwrap_or_else(|| default_data_dir().join("credential")),

            target_domain: args.domain,
            credential_name: args.credential_name,
            poll_interval: args.poll_interval,

            relay_endpoint: args.relay_endpoint.filter(|s| !s.trim().is_empty()),
            relay_auth_token: args.relay_auth_token.filter(|s| !s.trim().is_empty()),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            delivery_timeout: args.delivery_timeout,

            log_level: args.log_level,
            log_format: parse_log_format(&args.log_format),
        };

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval == 0 {
            anyhow::bail!("POLL_INTERVAL must be at least 1 second");
        }

        if self.delivery_timeout == 0 {
            anyhow::bail!("DELIVERY_TIMEOUT must be at least 1 second");
        }

        if self.http_connect_timeout == 0 {
            anyhow::bail!("HTTP_CONNECT_TIMEOUT must be at least 1 second");
        }

        if self.credential_name.trim().is_empty() {
            anyhow::bail!("CREDENTIAL_NAME cannot be empty");
        }

        if self.target_domain.trim_start_matches('.').is_empty() {
            anyhow::bail!("TARGET_DOMAIN cannot be empty");
        }

        Ok(())
    }

    /// Pipeline options derived from this configuration
    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            target: CredentialTarget::new(&self.target_domain, &self.credential_name),
            poll_interval: Duration::from_secs(self.poll_interval),
            connect_timeout: Duration::from_secs(self.http_connect_timeout),
            delivery_timeout: Duration::from_secs(self.delivery_timeout),
            ..OrchestratorOptions::default()
        }
    }
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// `~/.session-relay`, or the working directory without a home
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".session-relay"))
        .unwrap_or_else(|| PathBuf::from(".session-relay"))
}

/// Parse log format from string
fn parse_log_format(s: &str) -> LogFormat {
    match s.to_lowercase().as_str() {
        "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}


// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and no control key)
pub fn needs_interactive_setup() -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();
    let has_control_key = std::env::var("CONTROL_API_KEY").is_ok();

    !env_file_exists && !has_control_key
}

/// Run interactive setup to collect the relay settings
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("Session Relay - first time setup");
    println!();
    println!("No configuration found. Let's set up the relay.");
    println!();

    let control_api_key: String = Password::new()
        .with_prompt("Enter a key to protect the control API (CONTROL_API_KEY)")
        .interact()
        .context("Failed to read CONTROL_API_KEY")?;

    if control_api_key.is_empty() {
        anyhow::bail!("CONTROL_API_KEY cannot be empty");
    }

    println!();
    let relay_endpoint: String = Input::new()
        .with_prompt("Collector endpoint (RELAY_ENDPOINT)")
        .default(DEFAULT_ENDPOINT.to_string())
        .interact_text()
        .context("Failed to read RELAY_ENDPOINT")?;

    if reqwest::Url::parse(relay_endpoint.trim()).is_err() {
        anyhow::bail!("Collector endpoint is not a valid URL: {}", relay_endpoint);
    }

    println!();
    let relay_auth_token: String = Password::new()
        .with_prompt("Collector auth token, leave empty for none (RELAY_AUTH_TOKEN)")
        .allow_empty_password(true)
        .interact()
        .context("Failed to read RELAY_AUTH_TOKEN")?;

    println!();
    let poll_interval: String = Input::new()
        .with_prompt("Poll interval in seconds")
        .default("300".to_string())
        .interact_text()
        .context("Failed to read poll interval")?;

    let config = InteractiveConfig {
        control_api_key,
        relay_endpoint,
        relay_auth_token,
        poll_interval,
    };

    println!();
    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!();
        println!("Configuration saved to .env file");
    }

    println!();
    println!("Setup complete! Starting relay...");
    println!();

    Ok(config)
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub control_api_key: String,
    pub relay_endpoint: String,
    pub relay_auth_token: String,
    pub poll_interval: String,
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let env_content = format!(
        r#"# Session Relay Configuration
# Generated by interactive setup

# Key protecting the control API (required)
CONTROL_API_KEY={}

# Collector settings
RELAY_ENDPOINT={}
RELAY_AUTH_TOKEN={}

# Seconds between credential polls
POLL_INTERVAL={}

# Control API
SERVER_HOST=127.0.0.1
SERVER_PORT=8790

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=info
"#,
        config.control_api_key,
        config.relay_endpoint,
        config.relay_auth_token,
        config.poll_interval,
    );

    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(env_content.as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}
