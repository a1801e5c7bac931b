use std::time::Duration;

use clap::Args;

use crate::error::StatsError;
use crate::period::PeriodCalculator;

/// Engine settings shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true, global = true)]
    pub database_url: Option<String>,

    /// Local timezone offset used for period boundaries, in minutes east of UTC
    #[arg(
        long,
        default_value_t = 420,
        env = "STATS_TZ_OFFSET_MINUTES",
        allow_negative_numbers = true,
        global = true
    )]
    pub tz_offset_minutes: i32,

    /// Seconds between two aggregation sweeps
    #[arg(long, default_value_t = 120, env = "STATS_TICK_SECS", global = true)]
    pub tick_secs: u64,

    /// Upper bound on a single source read, in milliseconds
    #[arg(long, default_value_t = 5000, env = "STATS_READ_TIMEOUT_MS", global = true)]
    pub read_timeout_ms: u64,

    #[arg(long, default_value_t = 5, env = "STATS_DB_MAX_CONNECTIONS", global = true)]
    pub db_max_connections: u32,

    /// Port of the read API
    #[arg(long, default_value_t = 8080, env = "STATS_PORT", global = true)]
    pub port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            tz_offset_minutes: 420,
            tick_secs: 120,
            read_timeout_ms: 5000,
            db_max_connections: 5,
            port: 8080,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<(), StatsError> {
        if self.tick_secs == 0 {
            return Err(StatsError::Config("tick interval must be at least 1 second".to_string()));
        }
        if self.read_timeout_ms == 0 {
            return Err(StatsError::Config("read timeout must be positive".to_string()));
        }
        if self.db_max_connections == 0 {
            return Err(StatsError::Config(
                "database pool needs at least one connection".to_string(),
            ));
        }
        self.calculator().map(|_| ())
    }

    pub fn calculator(&self) -> Result<PeriodCalculator, StatsError> {
        PeriodCalculator::new(self.tz_offset_minutes)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.calculator().unwrap().offset_minutes(), 420);
        assert_eq!(settings.read_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_zero_tick_and_out_of_range_offset() {
        let settings = Settings {
            tick_secs: 0,
            ..Settings::default()
        };
        assert_eq!(settings.validate().unwrap_err().code(), "CONFIG");

        let settings = Settings {
            tz_offset_minutes: 15 * 60,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
