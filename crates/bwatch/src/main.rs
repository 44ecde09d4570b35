use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use bwatch_core::{
    config::Config,
    context::{AppContext, Collaborators},
    messaging::{
        port::NotifierPort,
        throttled::{ThrottleConfig, ThrottledNotifier},
    },
    ports::{Clock, SystemClock},
    store::{mirror::MirroredAccountStore, AccountStore},
};
use bwatch_rtdb::RtdbStore;
use bwatch_sqlite::SqliteStore;
use bwatch_telegram::{
    build_bot, fetch_bot_username,
    polling::{run_polling, spawn_shutdown_listener, LongPoller},
    TelegramFetcher, TelegramNotifier,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bwatch_core::logging::init("bwatch")?;

    let cfg = Arc::new(Config::load().context("loading configuration")?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let sqlite = Arc::new(
        SqliteStore::open(&cfg.db_path)
            .with_context(|| format!("opening database {}", cfg.db_path.display()))?,
    );

    let accounts: Arc<dyn AccountStore> = match &cfg.firebase {
        Some(fb) => {
            let remote = Arc::new(RtdbStore::new(&fb.url, fb.token.clone())?);
            let mirror = MirroredAccountStore::new(remote, sqlite.clone());
            match mirror.bootstrap_if_empty(clock.now()).await {
                Ok(true) => info!("Remote account store seeded"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Remote bootstrap failed; continuing"),
            }
            info!(url = %fb.url, "Account state: remote with local mirror");
            Arc::new(mirror)
        }
        None => {
            info!("Account state: local only");
            sqlite.clone()
        }
    };

    let bot = build_bot(&cfg.telegram_bot_token, &cfg.telegram_api_url)?;
    let bot_username = fetch_bot_username(&bot).await?;
    info!(bot = %bot_username, admin = %cfg.admin_id, "Bot identity resolved");

    let notifier: Arc<dyn NotifierPort> = Arc::new(ThrottledNotifier::new(
        Arc::new(TelegramNotifier::new(bot.clone())),
        ThrottleConfig::default(),
    ));

    let ctx = AppContext::new(
        cfg.clone(),
        Collaborators {
            accounts,
            cache: sqlite,
            notifier,
            fetcher: Arc::new(TelegramFetcher::new(bot)),
            clock,
        },
        bot_username,
    )
    .await;

    let poller = LongPoller::new(
        &cfg.telegram_api_url,
        &cfg.telegram_bot_token,
        cfg.poll_timeout,
    )?;
    if let Err(e) = poller.delete_webhook().await {
        warn!(error = %e, "deleteWebhook failed; polling anyway");
    }

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());
    run_polling(&ctx, poller, shutdown).await;

    Ok(())
}
