use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Database
    pub database_url: String,

    // Broker / market data
    pub alpaca_base_url: String,
    pub alpaca_data_url: String,
    pub alpaca_data_feed: String,

    // Notifications
    pub discord_webhook_url: Option<String>,

    // Market data fetch
    pub bar_limit: usize,              // 100 bars per fetch
    pub fetch_max_retries: u32,        // 3 attempts in total

    // Scheduling
    pub scheduler_tick_seconds: u64,   // 15
    pub reconcile_interval_seconds: u64, // 30
    pub unfilled_timeout_seconds: u64, // 120
    pub sweep_interval_seconds: u64,   // 60
    pub exit_check_interval_seconds: u64, // 60
    pub missing_order_limit: u32,      // 5 "order not found" polls before giving up
    pub max_concurrent_cycles: usize,  // 8

    // Behaviour switches
    pub async_execution: bool,         // spawn the buy path after the signal is recorded
    pub market_hours_only: bool,       // also gate on 09:30-16:00 ET

    // Live trading safety gate
    pub live_trading_approved: bool,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:crossover.db".to_string()),

            alpaca_base_url: env::var("ALPACA_BASE_URL")
                .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string()),
            alpaca_data_url: env::var("ALPACA_DATA_URL")
                .unwrap_or_else(|_| "https://data.alpaca.markets".to_string()),
            alpaca_data_feed: env::var("ALPACA_DATA_FEED")
                .unwrap_or_else(|_| "iex".to_string()),

            discord_webhook_url: env::var("DISCORD_WEBHOOK_URL")
                .ok()
                .filter(|s| !s.is_empty()),

            bar_limit: env::var("BAR_LIMIT")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
            fetch_max_retries: env::var("FETCH_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,

            scheduler_tick_seconds: env::var("SCHEDULER_TICK_SECONDS")
                .unwrap_or_else(|_| "15".to_string())
                .parse()?,
            reconcile_interval_seconds: env::var("RECONCILE_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            unfilled_timeout_seconds: env::var("UNFILLED_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()?,
            sweep_interval_seconds: env::var("SWEEP_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
            exit_check_interval_seconds: env::var("EXIT_CHECK_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
            missing_order_limit: env::var("MISSING_ORDER_LIMIT")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            max_concurrent_cycles: env::var("MAX_CONCURRENT_CYCLES")
                .unwrap_or_else(|_| "8".to_string())
                .parse()?,

            async_execution: env::var("ASYNC_EXECUTION")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            market_hours_only: env::var("MARKET_HOURS_ONLY")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,

            live_trading_approved: env::var("LIVE_TRADING_APPROVED")
                .map(|v| v.eq_ignore_ascii_case("yes"))
                .unwrap_or(false),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bar_limit < technical_analysis::SLOW_PERIOD {
            bail!(
                "BAR_LIMIT must be at least {} (EMA-{} needs that much history), got {}",
                technical_analysis::SLOW_PERIOD,
                technical_analysis::SLOW_PERIOD,
                self.bar_limit
            );
        }
        if self.fetch_max_retries == 0 {
            bail!("FETCH_MAX_RETRIES must be at least 1");
        }
        if self.scheduler_tick_seconds == 0
            || self.reconcile_interval_seconds == 0
            || self.sweep_interval_seconds == 0
            || self.exit_check_interval_seconds == 0
        {
            bail!("scheduler, reconcile, sweep and exit-check intervals must be non-zero");
        }
        if self.missing_order_limit == 0 {
            bail!("MISSING_ORDER_LIMIT must be at least 1");
        }
        if self.max_concurrent_cycles == 0 {
            bail!("MAX_CONCURRENT_CYCLES must be at least 1");
        }
        if self.database_url.trim().is_empty() {
            bail!("DATABASE_URL must not be empty");
        }
        Ok(())
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:crossover.db".to_string(),
            alpaca_base_url: "https://paper-api.alpaca.markets".to_string(),
            alpaca_data_url: "https://data.alpaca.markets".to_string(),
            alpaca_data_feed: "iex".to_string(),
            discord_webhook_url: None,
            bar_limit: 100,
            fetch_max_retries: 3,
            scheduler_tick_seconds: 15,
            reconcile_interval_seconds: 30,
            unfilled_timeout_seconds: 120,
            sweep_interval_seconds: 60,
            exit_check_interval_seconds: 60,
            missing_order_limit: 5,
            max_concurrent_cycles: 8,
            async_execution: false,
            market_hours_only: false,
            live_trading_approved: false,
        }
    }
}
