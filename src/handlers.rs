//! Inbound message handling and command bodies.
//!
//! Gating happens before any handler body runs: admin-only commands check
//! the sender against the configured admins, and in groups every other
//! command requires a verified sender.

use anyhow::Result;
use chrono::Utc;
use std::{path::Path, sync::Arc};
use teloxide::types::ChatId;
use tracing::{info, warn};

use crate::{
    app::{App, ExitKind},
    commands::{referral_payload, Command},
    events::{ChatKind, InboundMessage},
    gateway::{self, Verdict},
    registry::{Referral, UserRecord},
    settings::Toggle,
    store::write_atomic,
};

pub const FALLBACK: &str = "🤖 Unknown command. Use /help to see options.";
pub const ADMIN_ONLY: &str = "🚫 Admin only.";
pub const VERIFY_FIRST: &str = "🔒 Please complete the join verification before using commands here.";

const EXPORT_FILE: &str = "export-users.csv";
const WHITELIST_FILE: &str = "whitelist.csv";
const BACKUP_LIST_MAX: usize = 20;
const TOKEN: &str = "$ELONI";

const WELCOME: &str = "🌐 Welcome to Elonium AI
You're now part of the next-gen AI x DeFi revolution on Solana.

🚀 Earn $ELONI
📚 Learn & grow with AI modules
🔒 Stake, vote, and shape the future
🌟 Early supporters like you will be remembered

This is just the beginning. Let's build it together.";

const MENU: &[&[&str]] = &[
    &["/help", "/learn"],
    &["/reward", "/stats"],
    &["/register", "/id"],
    &["/invite", "/links"],
];

const HELP: &str = "Commands:
/start - Start the bot
/help - Show this menu
/reward - Claim daily $ELONI
/nextclaim - Check next claim time
/stats - Your stats
/register <wallet> - Register your Solana wallet
/invite - Your personal invite link
/learn - Learn-to-Earn
/links - Official links
/id - Your Telegram ID

Admin:
/exportcsv /whitelist /backuplist /snapshot /status
/togglemaintenance /toggleregister /closewhitelist /openwhitelist
/shutdown /restart";

const LEARN: &str = "📚 Learn-to-Earn
1. What is Elonium AI: AI agents meeting DeFi on Solana
2. Wallet safety: never share your seed phrase
3. Staking and governance basics

Claim your daily /reward after each module to earn $ELONI.";

pub async fn handle_message(app: &Arc<App>, msg: InboundMessage) -> Result<()> {
    app.observe(&msg.sender).await;
    if gateway::screen(app, &msg).await == Verdict::Stop {
        return Ok(());
    }

    let Some(cmd) = Command::parse(&msg.text, &app.me.username) else {
        if msg.chat_kind == ChatKind::Private {
            app.reply(msg.chat_id, FALLBACK).await;
        }
        return Ok(());
    };
    dispatch(app, &msg, cmd).await
}

async fn dispatch(app: &Arc<App>, msg: &InboundMessage, cmd: Command) -> Result<()> {
    let allowed = if cmd.is_admin_only() {
        ensure_admin(app, msg).await
    } else if matches!(cmd, Command::Unknown(_)) {
        true
    } else {
        ensure_verified(app, msg).await
    };
    if !allowed {
        return Ok(());
    }

    match cmd {
        Command::Start { referrer } => start(app, msg, referrer.as_deref()).await,
        Command::Register { wallet } => register(app, msg, wallet.as_deref()).await,
        Command::Help => help(app, msg).await,
        Command::Id => id(app, msg).await,
        Command::Reward => reward(app, msg).await,
        Command::NextClaim => next_claim(app, msg).await,
        Command::Stats => stats(app, msg).await,
        Command::Invite => invite(app, msg).await,
        Command::Learn => learn(app, msg).await,
        Command::Links => links(app, msg).await,
        Command::ExportCsv => export_csv(app, msg).await,
        Command::Whitelist => whitelist(app, msg).await,
        Command::BackupList => backup_list(app, msg).await,
        Command::Snapshot => snapshot(app, msg).await,
        Command::Status => status(app, msg).await,
        Command::ToggleMaintenance => toggle(app, msg, Toggle::Maintenance).await,
        Command::ToggleRegister => toggle(app, msg, Toggle::Registration).await,
        Command::CloseWhitelist => toggle(app, msg, Toggle::CloseWhitelist).await,
        Command::OpenWhitelist => toggle(app, msg, Toggle::OpenWhitelist).await,
        Command::Shutdown => exit(app, msg, ExitKind::Shutdown).await,
        Command::Restart => exit(app, msg, ExitKind::Restart).await,
        Command::Unknown(_) => {
            app.reply(msg.chat_id, FALLBACK).await;
            Ok(())
        }
    }
}

async fn ensure_admin(app: &App, msg: &InboundMessage) -> bool {
    if app.is_admin(msg.sender.id) {
        return true;
    }
    app.reply(msg.chat_id, ADMIN_ONLY).await;
    false
}

async fn ensure_verified(app: &App, msg: &InboundMessage) -> bool {
    if !msg.is_group() || !app.cfg.features.verification {
        return true;
    }
    if app.registry.is_verified(&msg.sender.key())
        || app.is_chat_admin(msg.chat_id, msg.sender.id).await
    {
        return true;
    }
    app.reply(msg.chat_id, VERIFY_FIRST).await;
    false
}

async fn start(app: &Arc<App>, msg: &InboundMessage, referrer: Option<&str>) -> Result<()> {
    let key = msg.sender.key();
    let bonus = if app.cfg.features.referral_rewards {
        app.cfg.rewards.referral_bonus
    } else {
        0
    };
    let outcome = match app.registry.start(&key, referrer, Utc::now(), bonus) {
        Ok(o) => o,
        Err(e) => {
            app.reply(msg.chat_id, e.reply_text()).await;
            return Ok(());
        }
    };
    if outcome.first_start {
        app.persist_users().await;
    }

    let _ = app.transport.send_menu(msg.chat_id, WELCOME, MENU).await;

    match outcome.referral {
        Referral::Accepted { referrer } => {
            info!("{} joined through an invite from {}", key, referrer);
            app.reply(msg.chat_id, "🤝 Thanks for joining through an invite!")
                .await;
            if let Ok(uid) = referrer.parse::<i64>() {
                let note = if bonus > 0 {
                    format!(
                        "🎉 {} joined with your invite link. +{} {}",
                        msg.sender.mention(),
                        bonus,
                        TOKEN
                    )
                } else {
                    format!("🎉 {} joined with your invite link.", msg.sender.mention())
                };
                app.reply(ChatId(uid), &note).await;
            }
        }
        Referral::Ignored(why) => {
            info!("referral for {} ignored: {}", key, why);
        }
        Referral::NotRequested => {}
    }
    Ok(())
}

async fn register(app: &Arc<App>, msg: &InboundMessage, wallet: Option<&str>) -> Result<()> {
    let Some(wallet) = wallet else {
        app.reply(msg.chat_id, "Usage: /register <wallet address>").await;
        return Ok(());
    };
    let settings = app.settings.get().await;
    if !settings.registration_enabled {
        app.reply(msg.chat_id, "🚫 Registration is currently closed.")
            .await;
        return Ok(());
    }
    if app.cfg.features.whitelist_phase && settings.whitelist_closed {
        app.reply(msg.chat_id, "🚫 The whitelist is closed. No new wallets are accepted.")
            .await;
        return Ok(());
    }

    match app
        .registry
        .register_wallet(&msg.sender.key(), wallet, Utc::now())
    {
        Ok(()) => {
            app.persist_users().await;
            app.reply(
                msg.chat_id,
                &format!("✅ Wallet address {} registered successfully.", wallet.trim()),
            )
            .await;
        }
        Err(e) => {
            app.reply(msg.chat_id, e.reply_text()).await;
        }
    }
    Ok(())
}

async fn help(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    app.reply(msg.chat_id, HELP).await;
    Ok(())
}

async fn id(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    app.reply(
        msg.chat_id,
        &format!("🆔 Your Telegram ID: {}", msg.sender.id.0),
    )
    .await;
    Ok(())
}

async fn reward(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    let amount = app.cfg.rewards.daily_amount;
    match app
        .registry
        .claim_reward(&msg.sender.key(), App::today(), amount)
    {
        Ok(total) => {
            app.persist_users().await;
            app.reply(
                msg.chat_id,
                &format!("✅ Earned {amount} {TOKEN}!\nTotal: {total} {TOKEN}"),
            )
            .await;
        }
        Err(e) => {
            app.reply(msg.chat_id, e.reply_text()).await;
        }
    }
    Ok(())
}

async fn next_claim(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    let text = match app.registry.can_claim(&msg.sender.key(), App::today()) {
        Some(true) => "✅ You can claim now. Use /reward to earn!",
        Some(false) => "⏳ Already claimed today. Next claim after midnight (UTC) 🌙",
        None => "❌ You need to /start first.",
    };
    app.reply(msg.chat_id, text).await;
    Ok(())
}

fn format_stats(rec: &UserRecord) -> String {
    format!(
        "📊 Your Stats:\nWallet: {}\nRewards: {} {}\nModules: {}\nInvites: {}\nLast Active: {}\nReferred By: {}\nVerified: {}",
        rec.wallet.as_deref().unwrap_or("Not set"),
        rec.total_rewards,
        TOKEN,
        rec.modules_completed,
        rec.invites,
        rec.last_active_date.as_deref().unwrap_or("Never"),
        rec.referred_by.as_deref().unwrap_or("None"),
        if rec.verified { "yes" } else { "no" },
    )
}

async fn stats(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    let text = match app.registry.get(&msg.sender.key()) {
        Some(rec) => format_stats(&rec),
        None => "❌ No data. Use /start.".to_string(),
    };
    app.reply(msg.chat_id, &text).await;
    Ok(())
}

async fn invite(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    let key = msg.sender.key();
    let invites = app.registry.get(&key).map(|r| r.invites).unwrap_or(0);
    let mut text = format!(
        "📨 Your invite link:\nhttps://t.me/{}?start={}\n\nInvites so far: {}",
        app.me.username,
        referral_payload(&key),
        invites
    );
    if app.cfg.features.referral_rewards {
        text.push_str(&format!(
            "\nEach new member earns you {} {}.",
            app.cfg.rewards.referral_bonus, TOKEN
        ));
    }
    app.reply(msg.chat_id, &text).await;
    Ok(())
}

async fn learn(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    app.reply(msg.chat_id, LEARN).await;
    Ok(())
}

async fn links(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    let text = if app.cfg.links.is_empty() {
        "🔗 No official links configured yet.".to_string()
    } else {
        let lines: Vec<String> = app
            .cfg
            .links
            .iter()
            .map(|l| format!("• {}: {}", l.label, l.url))
            .collect();
        format!("🔗 Official links:\n{}", lines.join("\n"))
    };
    app.reply(msg.chat_id, &text).await;
    Ok(())
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn users_csv(records: &[UserRecord]) -> String {
    let mut out = vec![
        "id,wallet,totalRewards,modulesCompleted,invites,first_name,username,language_code,verified"
            .to_string(),
    ];
    for r in records {
        out.push(
            [
                csv_field(&r.id),
                csv_field(r.wallet.as_deref().unwrap_or("")),
                r.total_rewards.to_string(),
                r.modules_completed.to_string(),
                r.invites.to_string(),
                csv_field(r.display_name.as_deref().unwrap_or("")),
                csv_field(r.handle.as_deref().unwrap_or("")),
                csv_field(r.locale_tag.as_deref().unwrap_or("")),
                r.verified.to_string(),
            ]
            .join(","),
        );
    }
    out.join("\n")
}

pub fn whitelist_csv(records: &[UserRecord]) -> String {
    let mut out = vec!["wallet,tier".to_string()];
    for w in records.iter().filter_map(|r| r.wallet.as_deref()) {
        out.push(format!("{},OG", csv_field(w)));
    }
    out.join("\n")
}

async fn send_export(app: &App, msg: &InboundMessage, name: &str, body: &str, caption: &str) {
    let path = app.store.path(name);
    if let Err(e) = write_atomic(&path, body.as_bytes()) {
        warn!("export {} failed: {:?}", path.display(), e);
        app.reply(msg.chat_id, "❌ Export failed, see logs.").await;
        return;
    }
    if app
        .transport
        .send_document(msg.chat_id, &path, caption)
        .await
        .is_err()
    {
        app.reply(msg.chat_id, "❌ Could not send the export file.")
            .await;
    }
}

async fn export_csv(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    let records = app.registry.records();
    let body = users_csv(&records);
    send_export(
        app,
        msg,
        EXPORT_FILE,
        &body,
        &format!("{} members", records.len()),
    )
    .await;
    Ok(())
}

async fn whitelist(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    let records = app.registry.records();
    let wallets = records.iter().filter(|r| r.wallet.is_some()).count();
    if wallets == 0 {
        app.reply(msg.chat_id, "📭 No wallets registered yet.").await;
        return Ok(());
    }
    send_export(
        app,
        msg,
        WHITELIST_FILE,
        &whitelist_csv(&records),
        &format!("{} wallets", wallets),
    )
    .await;
    Ok(())
}

fn file_name(p: &Path) -> String {
    p.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

async fn backup_list(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    let files = app.store.list_snapshots();
    if files.is_empty() {
        app.reply(msg.chat_id, "🗃️ No backups found.").await;
        return Ok(());
    }
    let shown: Vec<String> = files
        .iter()
        .rev()
        .take(BACKUP_LIST_MAX)
        .map(|p| file_name(p))
        .collect();
    let mut text = format!("🗂 Backups ({} total, newest first):\n{}", files.len(), shown.join("\n"));
    if files.len() > shown.len() {
        text.push_str(&format!("\n… and {} older", files.len() - shown.len()));
    }
    app.reply(msg.chat_id, &text).await;
    Ok(())
}

async fn snapshot(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    match app.persist_users().await {
        Some(path) => {
            let settings = app.settings.mark_snapshot(Utc::now()).await;
            app.persist_settings(&settings).await;
            app.reply(
                msg.chat_id,
                &format!("📸 Snapshot saved: {}", file_name(&path)),
            )
            .await;
        }
        None => {
            app.reply(msg.chat_id, "❌ Snapshot failed, see logs.").await;
        }
    }
    Ok(())
}

fn format_uptime(secs: i64) -> String {
    let secs = secs.max(0);
    let (d, h, m) = (secs / 86_400, (secs % 86_400) / 3600, (secs % 3600) / 60);
    if d > 0 {
        format!("{}d {}h {}m", d, h, m)
    } else if h > 0 {
        format!("{}h {}m", h, m)
    } else {
        format!("{}m {}s", m, secs % 60)
    }
}

fn on_off(b: bool) -> &'static str {
    if b {
        "on"
    } else {
        "off"
    }
}

async fn status(app: &Arc<App>, msg: &InboundMessage) -> Result<()> {
    let s = app.settings.get().await;
    let now = Utc::now();
    let uptime = s
        .process_started_at
        .map(|t| format_uptime((now - t).num_seconds()))
        .unwrap_or_else(|| "unknown".to_string());
    let last_snapshot = s
        .last_snapshot_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "never".to_string());
    let text = format!(
        "📟 Status\nUptime: {}\nMembers: {}\nVerified: {}\nWallets: {}\nPending verifications: {}\nBackups: {}\nLast manual snapshot: {}\nMaintenance: {}\nRegistration: {}\nWhitelist: {}",
        uptime,
        app.registry.len(),
        app.registry.verified_count(),
        app.registry.wallet_count(),
        app.verifier.pending_count(),
        app.store.list_snapshots().len(),
        last_snapshot,
        on_off(s.maintenance_mode),
        on_off(s.registration_enabled),
        if s.whitelist_closed { "closed" } else { "open" },
    );
    app.reply(msg.chat_id, &text).await;
    Ok(())
}

async fn toggle(app: &Arc<App>, msg: &InboundMessage, t: Toggle) -> Result<()> {
    let s = app.settings.apply(t).await;
    app.persist_settings(&s).await;
    info!("{:?} by {:?}: {:?}", t, msg.sender.id, s);
    let text = match t {
        Toggle::Maintenance => format!("🛠 Maintenance mode: {}", on_off(s.maintenance_mode)),
        Toggle::Registration => format!("📝 Registration: {}", on_off(s.registration_enabled)),
        Toggle::CloseWhitelist | Toggle::OpenWhitelist => format!(
            "📋 Whitelist is now {}",
            if s.whitelist_closed { "closed" } else { "open" }
        ),
    };
    app.reply(msg.chat_id, &text).await;
    Ok(())
}

async fn exit(app: &Arc<App>, msg: &InboundMessage, kind: ExitKind) -> Result<()> {
    app.persist_all().await;
    let delay = app.cfg.limits.shutdown_delay();
    let verb = match kind {
        ExitKind::Shutdown => "Shutting down",
        ExitKind::Restart => "Restarting",
    };
    app.reply(
        msg.chat_id,
        &format!("🛑 State saved. {} in {} s…", verb, delay.as_secs()),
    )
    .await;
    warn!("{:?} requested by {:?}", kind, msg.sender.id);

    let task_app = Arc::clone(app);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        task_app.request_exit(kind);
    });
    Ok(())
}
