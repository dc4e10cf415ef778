use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;

use crate::auth::DEFAULT_REFRESH_LEAD_SECS;
use crate::gemini::{DEFAULT_GEMINI_API_URL, DEFAULT_GEMINI_MODEL};
use crate::interceptor::DEFAULT_EXEMPT_PREFIX;

/// Portal Client - accounts and chatbot from the terminal
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend base URL
    #[arg(short = 'u', long, env = "PORTAL_API_URL", default_value = "http://localhost:4000")]
    pub api_url: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// File holding the persisted session
    #[arg(short = 's', long, env = "PORTAL_STORAGE_FILE")]
    pub storage_file: Option<String>,

    /// Keep the session in memory only
    #[arg(long, env = "PORTAL_EPHEMERAL", default_value = "false")]
    pub ephemeral: bool,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// HTTP max retries
    #[arg(long, env = "HTTP_MAX_RETRIES", default_value = "2")]
    pub http_retries: u32,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Sign in and keep the session refreshed
    Login {
        email: String,
        /// Prompted for when omitted
        #[arg(short, long)]
        password: Option<String>,
        /// Stay running so the session keeps refreshing
        #[arg(long)]
        stay: bool,
    },
    /// Renew the stored session
    Refresh,
    /// Revoke and forget the stored session
    Logout,
    /// Show the signed-in account
    Whoami,
    /// Send a message to the assistant
    Chat { message: String },
    /// Show the assistant conversation history
    History {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Delete the assistant conversation history
    ClearHistory,
    /// Create an account
    Register {
        email: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
    },
    /// Request a password reset email
    ForgotPassword { email: String },
    /// Ask the instructor assistant (needs GEMINI_API_KEY)
    Ask { message: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_url: String,

    // Session
    pub refresh_lead_secs: i64,
    /// `None` keeps the session in memory only
    pub storage_file: Option<PathBuf>,
    pub exempt_paths: Vec<String>,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,
    pub http_max_retries: u32,

    // Instructor chat
    pub gemini_api_url: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args), command))
    }

    /// Build config from parsed arguments plus env-only tunables
    pub fn from_args(args: CliArgs) -> Self {
        let storage_file = if args.ephemeral {
            None
        } else {
            Some(
                args.storage_file
                    .map(|s| expand_tilde(&s))
                    .unwrap_or_else(default_storage_file),
            )
        };

        Config {
            api_url: args.api_url,

            refresh_lead_secs: std::env::var("REFRESH_LEAD_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_REFRESH_LEAD_SECS),

            storage_file,

            exempt_paths: parse_exempt_paths(
                &std::env::var("EXEMPT_PATHS").unwrap_or_default(),
            ),

            http_connect_timeout: std::env::var("HTTP_CONNECT_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),

            http_request_timeout: args.http_timeout,

            http_max_retries: args.http_retries,

            gemini_api_url: std::env::var("GEMINI_API_URL")
                .unwrap_or_else(|_| DEFAULT_GEMINI_API_URL.to_string()),

            gemini_api_key: std::env::var("GEMINI_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),

            gemini_model: std::env::var("GEMINI_MODEL")
                .unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string()),

            log_level: args.log_level,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api_url)
            .with_context(|| format!("PORTAL_API_URL is not a valid URL: {}", self.api_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("PORTAL_API_URL must be http or https: {}", self.api_url);
        }

        Url::parse(&self.gemini_api_url)
            .with_context(|| format!("GEMINI_API_URL is not a valid URL: {}", self.gemini_api_url))?;

        if self.refresh_lead_secs < 0 {
            anyhow::bail!(
                "REFRESH_LEAD_SECS must not be negative: {}",
                self.refresh_lead_secs
            );
        }

        Ok(())
    }
}

/// Default location of the persisted session
fn default_storage_file() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("portal-client")
        .join("storage.json")
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

/// Parse a comma separated list of exempt path prefixes
fn parse_exempt_paths(s: &str) -> Vec<String> {
    let paths: Vec<String> = s
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            if p.starts_with('/') {
                p.to_string()
            } else {
                format!("/{}", p)
            }
        })
        .collect();

    if paths.is_empty() {
        vec![DEFAULT_EXEMPT_PREFIX.to_string()]
    } else {
        paths
    }
}
