pub mod client;
pub mod market_data;
pub mod models;

pub use broker_trait::BrokerClient;
pub use client::{credentials_from_env, is_paper_url, AlpacaClient, PAPER_BASE_URL};
pub use market_data::AlpacaDataClient;
pub use models::*;
