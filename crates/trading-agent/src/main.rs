use std::sync::Arc;
use std::time::Duration;

use alpaca_broker::{credentials_from_env, AlpacaClient, AlpacaDataClient};
use anyhow::Result;
use broker_trait::BrokerClient;
use market_data::{MarketCalendar, MarketDataFetcher, RetryPolicy};
use notification_service::{NotificationConfig, NotificationService};
use tokio::signal::unix::SignalKind;

use trading_agent::{
    ticker, AgentConfig, ExitMonitor, OrderReconciler, PositionStore, Scheduler,
    SettingsResolver, TradeCoordinator,
};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting EMA crossover trading agent");

    // 2. Configuration
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Bars per fetch: {}", config.bar_limit);
    tracing::info!("  Fetch attempts: {}", config.fetch_max_retries);
    tracing::info!(
        "  Scheduler tick: {}s, reconcile every {}s, unfilled after {}s",
        config.scheduler_tick_seconds,
        config.reconcile_interval_seconds,
        config.unfilled_timeout_seconds
    );
    tracing::info!(
        "  Concurrency: {} cycles, async execution {}",
        config.max_concurrent_cycles,
        config.async_execution
    );

    // 3. Broker, paper unless explicitly approved
    let (api_key, secret_key) = credentials_from_env()?;
    let alpaca = AlpacaClient::new(
        api_key.clone(),
        secret_key.clone(),
        config.alpaca_base_url.clone(),
    )?;
    if !alpaca.is_paper() {
        if !config.live_trading_approved {
            tracing::error!(
                "ALPACA_BASE_URL points to live trading ({}). \
                 Set LIVE_TRADING_APPROVED=yes to enable, or use \
                 https://paper-api.alpaca.markets for paper.",
                alpaca.base_url()
            );
            std::process::exit(1);
        }
        tracing::warn!("LIVE TRADING MODE: REAL MONEY AT RISK ({})", alpaca.base_url());
    } else {
        tracing::info!("Paper trading mode ({})", alpaca.base_url());
    }
    let broker: Arc<dyn BrokerClient> = Arc::new(alpaca);

    let data_client = AlpacaDataClient::new(
        &api_key,
        &secret_key,
        config.alpaca_data_url.clone(),
        config.alpaca_data_feed.clone(),
    )?;

    // 4. Database
    sqlx::any::install_default_drivers();
    let db_pool = sqlx::AnyPool::connect(&config.database_url).await?;
    sqlx::query("SELECT 1")
        .execute(&db_pool)
        .await
        .map_err(|e| anyhow::anyhow!("Database connectivity check failed: {}", e))?;
    let store = PositionStore::new(db_pool);
    store.init_tables().await?;
    tracing::info!("Startup check: database OK ({})", config.database_url);

    // 5. Notifications
    let notifier = NotificationService::new(&NotificationConfig {
        discord_webhook_url: config.discord_webhook_url.clone(),
        ..NotificationConfig::from_env()
    });
    tracing::info!("Notification channels: {}", notifier.channel_count());

    // 6. Engine
    let fetcher = MarketDataFetcher::new(Arc::new(data_client))
        .with_calendar(MarketCalendar::new().with_session_hours(config.market_hours_only))
        .with_policy(RetryPolicy::default().with_max_retries(config.fetch_max_retries))
        .with_bar_limit(config.bar_limit);
    let resolver = SettingsResolver::new(store.clone());

    let reconciler = OrderReconciler::new(store.clone(), Arc::clone(&broker), notifier.clone())
        .with_poll_interval(Duration::from_secs(config.reconcile_interval_seconds))
        .with_unfilled_timeout(chrono::Duration::seconds(config.unfilled_timeout_seconds as i64))
        .with_missing_order_limit(config.missing_order_limit);
    let exit_monitor = ExitMonitor::new(
        store.clone(),
        Arc::clone(&broker),
        fetcher.clone(),
        resolver.clone(),
        notifier.clone(),
    );
    let coordinator = TradeCoordinator::new(
        store.clone(),
        fetcher,
        Arc::clone(&broker),
        reconciler.clone(),
        exit_monitor,
        notifier.clone(),
    )
    .with_resolver(resolver.clone())
    .with_async_execution(config.async_execution)
    .with_max_concurrent_cycles(config.max_concurrent_cycles);

    // 7. Pick up pending entries left by a previous run
    let resumed = reconciler.resume_pending().await?;
    tracing::info!("Reconciliation resumed for {} pending position(s)", resumed);

    let tracked = store.tracked_pairs().await?;
    tracing::info!(
        "Tracking {} (user, symbol) pair(s) on {}",
        tracked.len(),
        broker.broker_name()
    );

    let mut scheduler = Scheduler::new(coordinator)
        .with_resolver(resolver)
        .with_sweep_interval(chrono::Duration::seconds(config.sweep_interval_seconds as i64))
        .with_exit_interval(chrono::Duration::seconds(config.exit_check_interval_seconds as i64));

    tracing::info!(
        "Agent is now running. Ticking every {}s. Press Ctrl+C to stop.",
        config.scheduler_tick_seconds
    );

    // Main loop with graceful shutdown (SIGINT + SIGTERM)
    let mut interval = ticker(Duration::from_secs(config.scheduler_tick_seconds));
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match scheduler.tick().await {
                    Ok(report) => {
                        if report.alerts_raised > 0 {
                            tracing::warn!("{} unfilled order alert(s) raised", report.alerts_raised);
                        }
                        if report.exits_closed > 0 {
                            tracing::info!("{} position(s) closed by the exit sweep", report.exits_closed);
                        }
                    }
                    Err(e) => tracing::error!("Error in scheduler tick: {}", e),
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutting down; {} order watcher(s) still pending", reconciler.watch_count());
                break;
            }
        }
    }

    Ok(())
}
