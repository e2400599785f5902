use crate::oauth::OAuthConfig;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_BIND: &str = "0.0.0.0:8443";
pub const DEFAULT_PORT_RANGE: RangeInclusive<u16> = 6000..=6999;
pub const DEFAULT_PROVISION_TIMEOUT_SECS: u64 = 300;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} is invalid: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Server configuration, read from `PGCLONE_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// `None` keeps all state in memory.
    pub database_url: Option<String>,
    pub root: PathBuf,
    pub baker: PathBuf,
    pub pg_ctl: Option<PathBuf>,
    pub port_range: RangeInclusive<u16>,
    pub provision_timeout: Duration,
    pub oauth: OAuthConfig,
    pub allowed_domain: Option<String>,
    pub shared_secret: Option<String>,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let bind_raw = get("PGCLONE_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_raw
            .parse::<SocketAddr>()
            .map_err(|e| invalid("PGCLONE_BIND", e))?;

        let port_range = match get("PGCLONE_PORT_RANGE") {
            Some(raw) => parse_port_range(&raw)?,
            None => DEFAULT_PORT_RANGE,
        };

        let provision_timeout = match get("PGCLONE_PROVISION_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse::<u64>()
                    .map_err(|e| invalid("PGCLONE_PROVISION_TIMEOUT_SECS", e))?,
            ),
            None => Duration::from_secs(DEFAULT_PROVISION_TIMEOUT_SECS),
        };

        let oauth = OAuthConfig {
            client_id: require("PGCLONE_OAUTH_CLIENT_ID")?,
            client_secret: require("PGCLONE_OAUTH_CLIENT_SECRET")?,
            redirect_url: require("PGCLONE_OAUTH_REDIRECT_URL")?,
            auth_url: url_or(
                "PGCLONE_OAUTH_AUTH_URL",
                get("PGCLONE_OAUTH_AUTH_URL"),
                GOOGLE_AUTH_URL,
            )?,
            token_url: url_or(
                "PGCLONE_OAUTH_TOKEN_URL",
                get("PGCLONE_OAUTH_TOKEN_URL"),
                GOOGLE_TOKEN_URL,
            )?,
            userinfo_url: url_or(
                "PGCLONE_OAUTH_USERINFO_URL",
                get("PGCLONE_OAUTH_USERINFO_URL"),
                GOOGLE_USERINFO_URL,
            )?,
            scopes: vec!["openid".to_string(), "email".to_string()],
        };

        Ok(Self {
            bind,
            database_url: get("PGCLONE_DATABASE_URL"),
            root: get("PGCLONE_ROOT")
                .unwrap_or_else(|| "/var/btrfs".to_string())
                .into(),
            baker: get("PGCLONE_BAKER")
                .unwrap_or_else(|| "pgclone-baker".to_string())
                .into(),
            pg_ctl: get("PGCLONE_PG_CTL").map(PathBuf::from),
            port_range,
            provision_timeout,
            oauth,
            allowed_domain: get("PGCLONE_ALLOWED_DOMAIN"),
            shared_secret: get("PGCLONE_SHARED_SECRET"),
        })
    }
}

fn invalid(var: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.to_string(),
    }
}

fn url_or(var: &'static str, value: Option<String>, default: &str) -> Result<Url, ConfigError> {
    Url::parse(value.as_deref().unwrap_or(default)).map_err(|e| invalid(var, e))
}

/// Parse `min-max` into an inclusive, non-empty range.
fn parse_port_range(raw: &str) -> Result<RangeInclusive<u16>, ConfigError> {
    const VAR: &str = "PGCLONE_PORT_RANGE";

    let (min, max) = raw
        .trim()
        .split_once('-')
        .ok_or_else(|| invalid(VAR, format!("expected min-max, got {raw:?}")))?;
    let min = min.trim().parse::<u16>().map_err(|e| invalid(VAR, e))?;
    let max = max.trim().parse::<u16>().map_err(|e| invalid(VAR, e))?;

    if min == 0 || min > max {
        return Err(invalid(VAR, format!("{min}-{max} is not a usable range")));
    }
    Ok(min..=max)
}
