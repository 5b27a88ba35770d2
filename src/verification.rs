//! New-member verification.
//!
//! A joiner that is not yet verified is restricted, shown a button carrying a
//! random code and given a fixed window to press it. Pressing the button in
//! the same chat lifts the restriction and marks the identity verified for
//! every monitored chat; letting the window pass removes the member.
//!
//! A new join while a challenge is pending supersedes it; chats where the
//! old challenge restricted the member are carried over and share the new
//! challenge's outcome.
//!
//! Each pending identity owns at most one removal timer. Timers carry a
//! generation number so a timer that lost a race against a newer one, or
//! against a resolution, does nothing when it fires.

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use teloxide::types::{ChatId, MessageId, UserId};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::{
    app::App,
    events::{CallbackEvent, ChatKind, JoinEvent, Sender},
    transport::Permissions,
};

pub const CALLBACK_PREFIX: &str = "v";
const CODE_LEN: usize = 6;
const MIN_RESUME_DELAY: Duration = Duration::from_secs(1);

pub const RESOLVE_OK: &str = "✅ Verified. Welcome!";
pub const RESOLVE_FAILED: &str = "❌ Verification failed: this challenge is not yours or has expired.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChallenge {
    pub user_id: u64,
    pub display_name: String,
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub origin_chat_id: i64,
    pub challenge_message_id: i32,
    /// Other chats where an earlier, superseded challenge left the member
    /// restricted. They share this challenge's outcome.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub held_chat_ids: Vec<i64>,
}

impl PendingChallenge {
    pub fn user(&self) -> UserId {
        UserId(self.user_id)
    }

    pub fn chat(&self) -> ChatId {
        ChatId(self.origin_chat_id)
    }

    pub fn message(&self) -> MessageId {
        MessageId(self.challenge_message_id)
    }

    /// Origin chat first, then the held chats.
    pub fn chats(&self) -> Vec<ChatId> {
        std::iter::once(self.origin_chat_id)
            .chain(self.held_chat_ids.iter().copied())
            .map(ChatId)
            .collect()
    }
}

struct TimerSlot {
    generation: u64,
    handle: AbortHandle,
}

pub struct Verifier {
    timeout: Duration,
    pending: DashMap<UserId, PendingChallenge>,
    timers: DashMap<UserId, TimerSlot>,
    generation: AtomicU64,
}

impl Verifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: DashMap::new(),
            timers: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending(&self, uid: UserId) -> Option<PendingChallenge> {
        self.pending.get(&uid).map(|p| p.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_list(&self) -> Vec<PendingChallenge> {
        let mut out: Vec<PendingChallenge> = self.pending.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|p| p.user_id);
        out
    }

    pub fn has_timer(&self, uid: UserId) -> bool {
        self.timers.contains_key(&uid)
    }

    fn cancel_timer(&self, uid: UserId) {
        if let Some((_, slot)) = self.timers.remove(&uid) {
            slot.handle.abort();
        }
    }
}

pub fn generate_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CODE_LEN)
        .map(char::from)
        .collect()
}

pub fn cb_data(chat: ChatId, code: &str) -> String {
    format!("{}:{}:{}", CALLBACK_PREFIX, chat.0, code)
}

pub fn parse_callback_data(data: &str) -> Option<(ChatId, String)> {
    let parts: Vec<&str> = data.split(':').collect();
    if parts.len() != 3 || parts[0] != CALLBACK_PREFIX || parts[2].is_empty() {
        return None;
    }
    let chat = parts[1].parse::<i64>().ok()?;
    Some((ChatId(chat), parts[2].to_string()))
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 60 && secs % 60 == 0 {
        let m = secs / 60;
        format!("{} minute{}", m, if m == 1 { "" } else { "s" })
    } else {
        format!("{} seconds", secs)
    }
}

fn arm_timer(app: &Arc<App>, user: UserId, chat: ChatId, delay: Duration) {
    let generation = app.verifier.generation.fetch_add(1, Ordering::Relaxed) + 1;
    let task_app = Arc::clone(app);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        on_timeout(&task_app, chat, user, generation).await;
    });
    let slot = TimerSlot {
        generation,
        handle: handle.abort_handle(),
    };
    if let Some(prev) = app.verifier.timers.insert(user, slot) {
        prev.handle.abort();
    }
}

pub async fn on_join(app: &Arc<App>, ev: JoinEvent) -> Result<()> {
    if !app.cfg.features.verification
        || ev.chat_kind != ChatKind::Group
        || !app.cfg.is_monitored(ev.chat_id)
    {
        return Ok(());
    }
    let chat = ev.chat_id;

    for member in &ev.members {
        if member.id == app.me.id {
            continue;
        }
        if member.is_bot {
            info!("removing foreign bot {:?} from {:?}", member.id, chat);
            if app.transport.remove_member(chat, member.id).await.is_err() {
                app.reply(
                    chat,
                    &format!(
                        "⚠️ I could not remove the bot {}. Please grant me the Ban users right.",
                        member.mention()
                    ),
                )
                .await;
            }
            continue;
        }
        if app.is_chat_admin(chat, member.id).await {
            continue;
        }
        if app.registry.is_verified(&member.key()) {
            app.reply(
                chat,
                &format!("👋 Welcome back, {}! You are already verified.", member.mention()),
            )
            .await;
            continue;
        }
        issue_challenge(app, chat, member).await;
    }
    Ok(())
}

async fn issue_challenge(app: &Arc<App>, chat: ChatId, member: &Sender) {
    let key = member.key();
    app.registry.get_or_create(&key, &member.profile());
    app.registry.set_verified(&key, false);
    app.persist_users().await;

    if let Err(e) = app
        .transport
        .restrict_member(chat, member.id, Permissions::Restricted)
        .await
    {
        warn!("could not restrict {:?} in {:?}: {:?}", member.id, chat, e);
        app.reply(
            chat,
            &format!(
                "⚠️ I could not restrict {} until verification. Please grant me the Restrict members right.",
                member.mention()
            ),
        )
        .await;
    }

    let mut held: Vec<i64> = Vec::new();
    if let Some((_, old)) = app.verifier.pending.remove(&member.id) {
        app.verifier.cancel_timer(member.id);
        let _ = app.transport.delete_message(old.chat(), old.message()).await;
        for c in old.chats() {
            if c != chat && !held.contains(&c.0) {
                held.push(c.0);
            }
        }
    }

    let code = generate_code();
    let timeout = app.verifier.timeout();
    let text = format!(
        "👋 Welcome {}! Tap the button below within {} to prove you are human, or you will be removed.",
        member.mention(),
        human_duration(timeout)
    );
    let message = match app
        .transport
        .send_challenge(chat, &text, "✅ I'm human", &cb_data(chat, &code))
        .await
    {
        Ok(mid) => mid,
        Err(e) => {
            warn!(
                "could not post challenge for {:?} in {:?}, lifting restriction: {:?}",
                member.id, chat, e
            );
            for c in std::iter::once(chat).chain(held.into_iter().map(ChatId)) {
                let _ = app
                    .transport
                    .restrict_member(c, member.id, Permissions::Full)
                    .await;
            }
            app.persist_pending().await;
            return;
        }
    };

    app.verifier.pending.insert(
        member.id,
        PendingChallenge {
            user_id: member.id.0,
            display_name: member.mention(),
            code,
            issued_at: Utc::now(),
            origin_chat_id: chat.0,
            challenge_message_id: message.0,
            held_chat_ids: held,
        },
    );
    arm_timer(app, member.id, chat, timeout);
    app.persist_pending().await;
    info!("challenge issued to {:?} in {:?}", member.id, chat);
}

pub async fn on_callback(app: &Arc<App>, ev: CallbackEvent) -> Result<()> {
    let Some((payload_chat, code)) = parse_callback_data(&ev.payload) else {
        let _ = app.transport.answer_callback(&ev.callback_id, "").await;
        return Ok(());
    };
    let uid = ev.sender.id;

    let resolved = app.verifier.pending.remove_if(&uid, |_, p| {
        p.code == code && p.chat() == payload_chat && ev.chat_id == Some(p.chat())
    });
    let Some((_, challenge)) = resolved else {
        debug!(
            "challenge resolution rejected for {:?} (message {:?})",
            uid, ev.message_id
        );
        let _ = app
            .transport
            .answer_callback(&ev.callback_id, RESOLVE_FAILED)
            .await;
        return Ok(());
    };

    app.verifier.cancel_timer(uid);
    let chat = challenge.chat();
    let key = ev.sender.key();
    app.registry.get_or_create(&key, &ev.sender.profile());
    app.registry.set_verified(&key, true);

    for c in challenge.chats() {
        if let Err(e) = app.transport.restrict_member(c, uid, Permissions::Full).await {
            warn!("could not lift restriction of {:?} in {:?}: {:?}", uid, c, e);
            app.reply(
                c,
                &format!(
                    "⚠️ {} is verified but I could not restore their permissions. An admin must do it manually.",
                    ev.sender.mention()
                ),
            )
            .await;
        }
    }
    let _ = app
        .transport
        .delete_message(chat, challenge.message())
        .await;

    app.persist_users().await;
    app.persist_pending().await;

    let _ = app.transport.answer_callback(&ev.callback_id, RESOLVE_OK).await;
    app.reply(
        chat,
        &format!("✅ {} is verified. Welcome aboard!", ev.sender.mention()),
    )
    .await;
    info!("{:?} verified in {:?}", uid, chat);
    Ok(())
}

async fn on_timeout(app: &Arc<App>, chat: ChatId, user: UserId, generation: u64) {
    let own_slot = app
        .verifier
        .timers
        .remove_if(&user, |_, slot| slot.generation == generation)
        .is_some();
    if !own_slot && app.verifier.timers.contains_key(&user) {
        debug!("stale timer for {:?} ignored", user);
        return;
    }

    let Some((_, challenge)) = app
        .verifier
        .pending
        .remove_if(&user, |_, p| p.chat() == chat)
    else {
        debug!("timer fired for {:?} without a pending challenge", user);
        return;
    };

    info!("verification timed out for {:?} in {:?}", user, chat);
    let _ = app
        .transport
        .delete_message(chat, challenge.message())
        .await;
    app.persist_pending().await;

    for c in challenge.chats() {
        let text = match app.transport.remove_member(c, user).await {
            Ok(()) => format!(
                "🚫 {} was removed: verification was not completed in time.",
                challenge.display_name
            ),
            Err(e) => {
                warn!("could not remove {:?} from {:?}: {:?}", user, c, e);
                format!(
                    "⚠️ {} did not complete verification, but I could not remove them. They stay restricted; please grant me the Ban users right or remove them manually.",
                    challenge.display_name
                )
            }
        };
        app.reply(c, &text).await;
    }
}

/// Reloads challenges saved by a previous run. Challenges older than the
/// timeout window are dropped; the rest get a timer for what is left of
/// their window.
pub async fn restore_pending(app: &Arc<App>) -> usize {
    let now = Utc::now();
    let window = chrono::Duration::from_std(app.verifier.timeout())
        .unwrap_or_else(|_| chrono::Duration::seconds(300));
    let mut pruned = 0;
    let mut resumed = 0;

    for ch in app.store.load_pending() {
        let age = now - ch.issued_at;
        if age > window {
            info!(
                "pruning stale challenge of {} in {} (issued {})",
                ch.user_id, ch.origin_chat_id, ch.issued_at
            );
            pruned += 1;
            continue;
        }
        let remaining = (window - age).to_std().unwrap_or(MIN_RESUME_DELAY);
        let (user, chat) = (ch.user(), ch.chat());
        app.verifier.pending.insert(user, ch);
        arm_timer(app, user, chat, remaining.max(MIN_RESUME_DELAY));
        resumed += 1;
    }

    app.persist_pending().await;
    if pruned + resumed > 0 {
        info!("pending challenges: {} resumed, {} pruned", resumed, pruned);
    }
    resumed
}
