use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr:          SocketAddr,
    pub jwt_secret:         String,
    pub database_url:       Option<String>,
    pub reconcile_interval: Duration,
    pub typing_idle:        Duration,
    pub send_timeout:       Duration,
    pub max_message_chars:  usize,
    pub history_limit:      usize,
    pub ring_capacity:      usize,
    pub live_status_global: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr:          SocketAddr::from(([0, 0, 0, 0], 3000)),
            jwt_secret:         String::new(),
            database_url:       None,
            reconcile_interval: Duration::from_secs(30),
            typing_idle:        Duration::from_secs(4),
            send_timeout:       Duration::from_secs(8),
            max_message_chars:  2000,
            history_limit:      50,
            ring_capacity:      500,
            live_status_global: true,
        }
    }
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            bind_addr:          parse_or("BIND_ADDR", d.bind_addr)?,
            jwt_secret:         env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            database_url:       env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            reconcile_interval: secs_or("RECONCILE_INTERVAL_SECS", d.reconcile_interval)?,
            typing_idle:        secs_or("TYPING_IDLE_SECS", d.typing_idle)?,
            send_timeout:       secs_or("SEND_TIMEOUT_SECS", d.send_timeout)?,
            max_message_chars:  parse_or("MAX_MESSAGE_CHARS", d.max_message_chars)?,
            history_limit:      parse_or("HISTORY_LIMIT", d.history_limit)?,
            ring_capacity:      parse_or("RING_CAPACITY", d.ring_capacity)?,
            live_status_global: parse_or("LIVE_STATUS_GLOBAL", d.live_status_global)?,
        })
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("{key}={raw:?} is invalid")),
        Err(_) => Ok(default),
    }
}

fn secs_or(key: &str, default: Duration) -> Result<Duration> {
    let secs: u64 = parse_or(key, default.as_secs())?;
    Ok(Duration::from_secs(secs.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_keys_fall_back_to_defaults() {
        let v: usize = parse_or("NIGHTLIFE_CHAT_SURELY_UNSET", 7).unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn typing_window_is_several_refresh_intervals() {
        let c = Config::default();
        assert!(c.typing_idle >= Duration::from_secs(3));
        assert!(c.typing_idle <= Duration::from_secs(5));
    }
}
