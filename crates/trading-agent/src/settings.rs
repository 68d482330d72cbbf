use trading_core::Timeframe;

use crate::error::EngineError;
use crate::store::{BotSettingsRow, PositionStore};

/// Per-user strategy parameters for one cycle. Resolved fresh from storage at
/// the start of every cycle so edits take effect on the next poll.
#[derive(Debug, Clone, PartialEq)]
pub struct TradingSettings {
    pub timeframe: Timeframe,
    /// Take-profit distance, in percent of entry (2.0 = 2%)
    pub profit_percentage: f64,
    /// Stop-loss distance, in percent of entry
    pub loss_percentage: f64,
    pub confirmation_bars: usize,
    /// Notional dollars per entry
    pub trade_amount: f64,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            timeframe: Timeframe::Minute5,
            profit_percentage: 2.0,
            loss_percentage: 1.0,
            confirmation_bars: 3,
            trade_amount: 1000.0,
        }
    }
}

impl TradingSettings {
    pub fn profit_threshold(&self) -> f64 {
        self.profit_percentage / 100.0
    }

    pub fn loss_threshold(&self) -> f64 {
        self.loss_percentage / 100.0
    }

    pub fn take_profit_price(&self, entry_price: f64) -> f64 {
        entry_price * (1.0 + self.profit_threshold())
    }

    pub fn stop_loss_price(&self, entry_price: f64) -> f64 {
        entry_price * (1.0 - self.loss_threshold())
    }

    /// Build from a stored row, rejecting values the engine cannot trade on.
    pub fn from_row(row: &BotSettingsRow) -> Result<Self, EngineError> {
        let timeframe: Timeframe = row.timeframe.parse().map_err(EngineError::Validation)?;

        if !(row.profit_percentage.is_finite() && row.profit_percentage > 0.0) {
            return Err(EngineError::Validation(format!(
                "profit_percentage must be positive, got {}",
                row.profit_percentage
            )));
        }
        if !(row.loss_percentage.is_finite() && row.loss_percentage > 0.0 && row.loss_percentage < 100.0) {
            return Err(EngineError::Validation(format!(
                "loss_percentage must be in (0, 100), got {}",
                row.loss_percentage
            )));
        }
        if row.confirmation_bars < 1 {
            return Err(EngineError::Validation(format!(
                "confirmation_bars must be at least 1, got {}",
                row.confirmation_bars
            )));
        }
        if !(row.trade_amount.is_finite() && row.trade_amount > 0.0) {
            return Err(EngineError::Validation(format!(
                "trade_amount must be positive, got {}",
                row.trade_amount
            )));
        }

        Ok(Self {
            timeframe,
            profit_percentage: row.profit_percentage,
            loss_percentage: row.loss_percentage,
            confirmation_bars: row.confirmation_bars as usize,
            trade_amount: row.trade_amount,
        })
    }

    pub fn to_row(&self) -> BotSettingsRow {
        BotSettingsRow {
            timeframe: self.timeframe.as_str().to_string(),
            profit_percentage: self.profit_percentage,
            loss_percentage: self.loss_percentage,
            confirmation_bars: self.confirmation_bars as i64,
            trade_amount: self.trade_amount,
        }
    }
}

/// Looks up a user's settings, falling back to defaults when no row exists.
#[derive(Clone)]
pub struct SettingsResolver {
    store: PositionStore,
    defaults: TradingSettings,
}

impl SettingsResolver {
    pub fn new(store: PositionStore) -> Self {
        Self {
            store,
            defaults: TradingSettings::default(),
        }
    }

    pub fn with_defaults(mut self, defaults: TradingSettings) -> Self {
        self.defaults = defaults;
        self
    }

    pub async fn resolve(&self, user_id: i64) -> Result<TradingSettings, EngineError> {
        match self.store.bot_settings(user_id).await? {
            Some(row) => TradingSettings::from_row(&row),
            None => Ok(self.defaults.clone()),
        }
    }
}
