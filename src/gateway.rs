//! Policy applied to every inbound message before command dispatch:
//! maintenance gate, per-identity rate limit, link filter.

use anyhow::{Context, Result};
use dashmap::DashMap;
use regex::Regex;
use std::{sync::Arc, time::Duration};
use teloxide::types::UserId;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::{app::App, events::InboundMessage};

pub const MAINTENANCE_NOTICE: &str =
    "🛠 The bot is under maintenance right now. Please try again later.";

const LINK_PATTERN: &str = r"(?i)(?:https?://|www\.|t\.me/|telegram\.me/)\S+|\b[a-z0-9][a-z0-9-]*\.(?:com|net|org|io|xyz|me|gg|app|co|ru|info|biz|finance|link|site|online|top)\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Stop,
}

pub struct Gateway {
    cooldown: Duration,
    last_seen: DashMap<UserId, Instant>,
    link_re: Regex,
}

impl Gateway {
    pub fn new(cooldown: Duration) -> Result<Self> {
        Ok(Self {
            cooldown,
            last_seen: DashMap::new(),
            link_re: Regex::new(LINK_PATTERN).context("compile link filter")?,
        })
    }

    /// Records an event from `uid` at `now` and reports whether it arrived
    /// within the cooldown of the previous one.
    pub fn throttled(&self, uid: UserId, now: Instant) -> bool {
        let mut throttled = false;
        self.last_seen
            .entry(uid)
            .and_modify(|prev| {
                throttled = now.saturating_duration_since(*prev) < self.cooldown;
                *prev = now;
            })
            .or_insert(now);
        throttled
    }

    pub fn contains_link(&self, text: &str) -> bool {
        self.link_re.is_match(text)
    }
}

pub async fn screen(app: &Arc<App>, msg: &InboundMessage) -> Verdict {
    let uid = msg.sender.id;
    let admin = if msg.is_group() {
        app.is_chat_admin(msg.chat_id, uid).await
    } else {
        app.is_admin(uid)
    };
    if admin {
        return Verdict::Pass;
    }

    if app.settings.maintenance().await {
        app.reply(msg.chat_id, MAINTENANCE_NOTICE).await;
        return Verdict::Stop;
    }

    if app.gateway.throttled(uid, Instant::now()) {
        debug!("rate limited {:?} in {:?}", uid, msg.chat_id);
        return Verdict::Stop;
    }

    if msg.is_group() && app.gateway.contains_link(&msg.text) {
        info!("link removed from {:?} in {:?}", uid, msg.chat_id);
        let _ = app
            .transport
            .delete_message(msg.chat_id, msg.message_id)
            .await;
        let warning = format!("⚠️ {}, links are not allowed here.", msg.sender.mention());
        if let Some(mid) = app.reply(msg.chat_id, &warning).await {
            let transport = app.transport.clone();
            let chat = msg.chat_id;
            let delay = app.cfg.limits.link_warning();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = transport.delete_message(chat, mid).await;
            });
        }
        return Verdict::Stop;
    }

    Verdict::Pass
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        settings::Toggle,
        testing::{group_message, private_message, Call, TestBed, ADMIN, GROUP},
    };

    #[test]
    fn link_detection() {
        let gw = Gateway::new(Duration::from_secs(1)).unwrap();
        for t in [
            "join https://scam.example now",
            "visit www.pump.fun",
            "t.me/freetokens",
            "check airdrop-eloni.xyz",
            "CLAIM AT ELONI.COM",
        ] {
            assert!(gw.contains_link(t), "{t}");
        }
        for t in ["hello there", "price is 1.5 today", "/reward", "gm.gn"] {
            assert!(!gw.contains_link(t), "{t}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_window() {
        let gw = Gateway::new(Duration::from_secs(1)).unwrap();
        let u = UserId(5);
        let t0 = Instant::now();
        assert!(!gw.throttled(u, t0));
        assert!(gw.throttled(u, t0 + Duration::from_millis(500)));
        assert!(!gw.throttled(u, t0 + Duration::from_millis(1600)));
        assert!(!gw.throttled(UserId(6), t0 + Duration::from_millis(1600)));
    }

    #[tokio::test(start_paused = true)]
    async fn second_event_within_cooldown_is_dropped_silently() {
        let bed = TestBed::new();
        let msg = private_message(10, "/id");

        assert_eq!(screen(&bed.app, &msg).await, Verdict::Pass);
        tokio::time::advance(Duration::from_millis(300)).await;
        assert_eq!(screen(&bed.app, &msg).await, Verdict::Stop);
        assert!(bed.transport.calls().is_empty());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(screen(&bed.app, &msg).await, Verdict::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn admins_skip_rate_limit_and_maintenance() {
        let bed = TestBed::new();
        bed.app.settings.apply(Toggle::Maintenance).await;
        let msg = private_message(ADMIN, "/status");
        assert_eq!(screen(&bed.app, &msg).await, Verdict::Pass);
        assert_eq!(screen(&bed.app, &msg).await, Verdict::Pass);
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_notice_for_members() {
        let bed = TestBed::new();
        bed.app.settings.apply(Toggle::Maintenance).await;
        let msg = private_message(10, "/reward");
        assert_eq!(screen(&bed.app, &msg).await, Verdict::Stop);
        assert_eq!(bed.transport.texts_to(msg.chat_id), vec![MAINTENANCE_NOTICE]);
    }

    #[tokio::test(start_paused = true)]
    async fn group_link_is_deleted_and_warning_expires() {
        let bed = TestBed::new();
        let msg = group_message(10, "free tokens at https://scam.example");
        assert_eq!(screen(&bed.app, &msg).await, Verdict::Stop);

        let calls = bed.transport.calls();
        assert!(calls.contains(&Call::Delete {
            chat: GROUP,
            message: msg.message_id
        }));
        let warning_id = bed.transport.last_sent_id();
        assert!(!calls.contains(&Call::Delete {
            chat: GROUP,
            message: warning_id
        }));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(bed.transport.calls().contains(&Call::Delete {
            chat: GROUP,
            message: warning_id
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn links_in_private_chats_pass() {
        let bed = TestBed::new();
        let msg = private_message(10, "https://elonium.ai");
        assert_eq!(screen(&bed.app, &msg).await, Verdict::Pass);
    }
}
