mod app;
mod commands;
mod config;
mod error;
mod events;
mod gateway;
mod handlers;
mod registry;
mod settings;
mod store;
#[cfg(test)]
mod testing;
mod transport;
mod verification;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::{path::PathBuf, sync::Arc, time::Duration};
use teloxide::{
    dispatching::UpdateHandler,
    dptree,
    prelude::*,
    types::{CallbackQuery, ChatId, Message},
};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    app::{App, BotIdentity, ExitKind},
    config::{load_config, parse_config_arg, parse_hhmm_utc, validate_config},
    events::{CallbackEvent, InboundMessage, JoinEvent},
    transport::TelegramTransport,
};

const DEFAULT_CONFIG: &str = "config.yaml";
const ADMIN_REFRESH_EVERY: Duration = Duration::from_secs(180);

fn next_daily_in_utc(now: DateTime<Utc>, hh: u32, mm: u32) -> DateTime<Utc> {
    let today = now.date_naive();
    let at = |d: NaiveDate| d.and_hms_opt(hh, mm, 0).map(|t| t.and_utc());
    match at(today) {
        Some(t) if t > now => t,
        _ => today
            .succ_opt()
            .and_then(at)
            .unwrap_or(now + chrono::Duration::days(1)),
    }
}

async fn snapshot_cleanup_task(app: Arc<App>, mut shutdown_rx: broadcast::Receiver<()>) {
    let retention = app.store.retention().clone();
    if !retention.enable_daily_cleanup {
        return;
    }
    let (hh, mm) = parse_hhmm_utc(&retention.daily_cleanup_at).unwrap_or((3, 30));

    loop {
        let now = Utc::now();
        let sleep = (next_daily_in_utc(now, hh, mm) - now)
            .to_std()
            .unwrap_or(Duration::from_secs(3600));

        tokio::select! {
            _ = shutdown_rx.recv() => { break; }
            _ = tokio::time::sleep(sleep) => {
                app.store.cleanup_snapshots_once(Utc::now());
            }
        }
    }
}

async fn admin_refresh_task(app: Arc<App>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(ADMIN_REFRESH_EVERY);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => { break; }
            _ = ticker.tick() => {
                app.refresh_known_admins().await;
            }
        }
    }
}

fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry()
        .branch(
            Update::filter_message().endpoint(|app: Arc<App>, msg: Message| async move {
                if let Some(ev) = JoinEvent::from_message(&msg) {
                    verification::on_join(&app, ev).await?;
                    return Ok(());
                }
                if let Some(inbound) = InboundMessage::from_message(&msg) {
                    handlers::handle_message(&app, inbound).await?;
                }
                Ok(())
            }),
        )
        .branch(
            Update::filter_callback_query().endpoint(
                |app: Arc<App>, q: CallbackQuery| async move {
                    if let Some(ev) = CallbackEvent::from_query(&q) {
                        verification::on_callback(&app, ev).await?;
                    }
                    Ok(())
                },
            ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let explicit = parse_config_arg(&args);
    let config_path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));

    let cfg = load_config(&config_path, explicit.is_some())?;
    validate_config(&cfg)?;

    let filter = cfg.bot.log_level.clone().unwrap_or_else(|| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let token = cfg.resolve_token().context("startup aborted")?;
    let bot = Bot::new(token);

    let me = bot.get_me().send().await.context("get_me")?;
    let identity = BotIdentity {
        id: me.user.id,
        username: me.user.username.clone().unwrap_or_else(|| "bot".into()),
    };

    let app = App::new(cfg, Arc::new(TelegramTransport::new(bot.clone())), identity)?;

    let started = app.settings.mark_started(Utc::now()).await;
    app.persist_settings(&started).await;
    verification::restore_pending(&app).await;

    for chat in app.cfg.groups.iter().map(|g| ChatId(*g)) {
        if let Err(e) = app.refresh_admins(chat).await {
            warn!("refresh_admins failed (startup) for {:?}: {:?}", chat, e);
        }
    }

    let (shutdown_tx, _shutdown_rx0) = broadcast::channel::<()>(8);

    let h_admin = tokio::spawn(admin_refresh_task(app.clone(), shutdown_tx.subscribe()));
    let h_snap = tokio::spawn(snapshot_cleanup_task(app.clone(), shutdown_tx.subscribe()));

    info!(
        "Start polling as @{} ({} members known)",
        app.me.username,
        app.registry.len()
    );

    let mut exit_rx = app.subscribe_exit();
    let mut dispatcher = Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![app.clone()])
        .default_handler(|_upd| async {})
        .error_handler(LoggingErrorHandler::with_custom_text("Dispatcher error"))
        .enable_ctrlc_handler()
        .build();

    let kind = tokio::select! {
        _ = dispatcher.dispatch() => ExitKind::Shutdown,
        requested = exit_rx.recv() => requested.unwrap_or(ExitKind::Shutdown),
    };

    let _ = shutdown_tx.send(());
    let _ = h_admin.await;
    let _ = h_snap.await;

    app.persist_all().await;
    info!("{:?}: state saved, exiting with {}", kind, kind.exit_code());

    if kind == ExitKind::Restart {
        std::process::exit(kind.exit_code());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn next_daily_later_today() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 1, 0, 0).unwrap();
        let next = next_daily_in_utc(now, 3, 30);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 1, 3, 30, 0).unwrap());
    }

    #[test]
    fn next_daily_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 3, 30, 0).unwrap();
        let next = next_daily_in_utc(now, 3, 30);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 5, 2, 3, 30, 0).unwrap());
    }
}
