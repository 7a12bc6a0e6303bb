use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};

use crate::turns::TurnSettings;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_GROUP_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub jwt_secret: String,
    pub turns: TurnSettings,
    pub group_capacity: usize,
    pub questions_file: Option<PathBuf>,
}

impl Config {
    /// Reads the process environment, including a `.env` file if present.
    pub fn from_env() -> anyhow::Result<Config> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let database_url = lookup("DATABASE_URL").ok_or(anyhow!("DATABASE_URL is not set"))?;
        let jwt_secret = lookup("JWT_SECRET").ok_or(anyhow!("JWT_SECRET is not set"))?;
        if jwt_secret.is_empty() {
            return Err(anyhow!("JWT_SECRET must not be empty"));
        }

        let bind_addr: SocketAddr = parse_or(&lookup, "BIND_ADDR", DEFAULT_BIND_ADDR.parse()?)?;

        let defaults = TurnSettings::default();
        let turns = TurnSettings {
            interval: Duration::from_secs(parse_or(&lookup, "TURN_INTERVAL_SECS", defaults.interval.as_secs())?),
            limit: parse_or(&lookup, "TURN_LIMIT", defaults.limit)?,
        };

        let group_capacity = parse_or(&lookup, "GROUP_CAPACITY", DEFAULT_GROUP_CAPACITY)?;
        if group_capacity == 0 {
            return Err(anyhow!("GROUP_CAPACITY must be at least 1"));
        }

        Ok(Config {
            database_url,
            bind_addr,
            jwt_secret,
            turns,
            group_capacity,
            questions_file: lookup("QUESTIONS_FILE").map(PathBuf::from),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().with_context(|| format!("invalid {key}: {raw:?}")),
        None => Ok(default),
    }
}
