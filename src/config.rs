use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, time::Duration};

pub const DEFAULT_APISERVER_PROTOCOL: &str = "https";
pub const DEFAULT_APISERVER_HOST: &str = "api.dnanexus.com";
pub const DEFAULT_APISERVER_PORT: u16 = 443;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
pub const API_VERSION: &str = "1.0.0";

/// Credentials read from `DX_SECURITY_CONTEXT`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SecurityContext {
    pub auth_token_type: String,
    pub auth_token: String,
}

impl SecurityContext {
    pub fn authorization(&self) -> String {
        format!("{} {}", self.auth_token_type, self.auth_token)
    }
}

/// Where and how to reach the API server.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub security_context: Option<SecurityContext>,
    /// Timeout of a single HTTP attempt.
    pub request_timeout: Duration,
    /// Deadline for one logical call, retries and waits included.
    pub total_timeout: Option<Duration>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_APISERVER_PROTOCOL.into(),
            host: DEFAULT_APISERVER_HOST.into(),
            port: DEFAULT_APISERVER_PORT,
            security_context: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            total_timeout: None,
        }
    }
}

/// Command-line overrides, flattened into the CLI.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ApiArgs {
    /// API server host (overrides DX_APISERVER_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// API server port (overrides DX_APISERVER_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// API server protocol, http or https (overrides DX_APISERVER_PROTOCOL)
    #[arg(long, global = true)]
    pub protocol: Option<String>,
}

impl ApiConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(protocol) = lookup("DX_APISERVER_PROTOCOL") {
            cfg.protocol = protocol;
        }
        if let Some(host) = lookup("DX_APISERVER_HOST") {
            cfg.host = host;
        }
        if let Some(value) = lookup("DX_APISERVER_PORT") {
            cfg.port = value
                .parse::<u16>()
                .with_context(|| format!("parsing DX_APISERVER_PORT value `{}`", value))?;
        }
        if let Some(raw) = lookup("DX_SECURITY_CONTEXT") {
            let ctx: SecurityContext =
                serde_json::from_str(&raw).context("parsing DX_SECURITY_CONTEXT")?;
            cfg.security_context = Some(ctx);
        }
        if let Some(value) = lookup("DX_REQUEST_TIMEOUT_SECS") {
            let secs = value
                .parse::<u64>()
                .with_context(|| format!("parsing DX_REQUEST_TIMEOUT_SECS value `{}`", value))?;
            cfg.request_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = lookup("DX_TOTAL_TIMEOUT_SECS") {
            let secs = value
                .parse::<u64>()
                .with_context(|| format!("parsing DX_TOTAL_TIMEOUT_SECS value `{}`", value))?;
            cfg.total_timeout = Some(Duration::from_secs(secs));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply command-line overrides on top of the environment.
    pub fn merge_args(mut self, args: &ApiArgs) -> Result<Self> {
        if let Some(host) = &args.host {
            self.host = host.clone();
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(protocol) = &args.protocol {
            self.protocol = protocol.clone();
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if !matches!(self.protocol.as_str(), "http" | "https") {
            anyhow::bail!("unsupported API server protocol `{}`", self.protocol);
        }
        if self.host.is_empty() {
            anyhow::bail!("API server host is empty");
        }
        Ok(())
    }

    pub fn api_server(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn user_agent() -> String {
        format!(
            "{}/{} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS
        )
    }
}
