//! In-memory transport and fixtures for unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};
use teloxide::types::{ChatId, MessageId, UserId};
use tempfile::TempDir;

use crate::{
    app::{App, BotIdentity},
    config::Config,
    events::{CallbackEvent, ChatKind, InboundMessage, JoinEvent, Sender},
    handlers,
    transport::{ChatTransport, Permissions},
};

pub const ADMIN: u64 = 1;
pub const BOT_ID: u64 = 999;
pub const BOT_USERNAME: &str = "EloniumBot";
pub const GROUP: ChatId = ChatId(-100500);
pub const OTHER_GROUP: ChatId = ChatId(-100600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Text { chat: ChatId, text: String },
    Challenge { chat: ChatId, text: String, payload: String },
    Menu { chat: ChatId, text: String },
    Document { chat: ChatId, file_name: String },
    Delete { chat: ChatId, message: MessageId },
    Restrict { chat: ChatId, user: UserId, perms: Permissions },
    Remove { chat: ChatId, user: UserId },
    Answer { callback_id: String, text: String },
}

#[derive(Default)]
struct Recorded {
    calls: Vec<Call>,
    next_id: i32,
    last_sent: Option<MessageId>,
    chat_admins: Vec<UserId>,
    fail_restrict: bool,
    fail_remove: bool,
    fail_admin_fetch: bool,
    admin_fetches: usize,
}

#[derive(Default)]
pub struct RecordingTransport {
    inner: Mutex<Recorded>,
}

impl RecordingTransport {
    fn with<R>(&self, f: impl FnOnce(&mut Recorded) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    fn record_sent(&self, call: Call) -> MessageId {
        self.with(|r| {
            r.next_id += 1;
            let id = MessageId(r.next_id);
            r.last_sent = Some(id);
            r.calls.push(call);
            id
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|r| r.calls.clone())
    }

    pub fn texts_to(&self, chat: ChatId) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Text { chat: c, text } if c == chat => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn last_sent_id(&self) -> MessageId {
        self.with(|r| r.last_sent.unwrap_or(MessageId(0)))
    }

    pub fn challenges(&self) -> Vec<(ChatId, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Challenge { chat, payload, .. } => Some((chat, payload)),
                _ => None,
            })
            .collect()
    }

    pub fn answers(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Answer { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn set_chat_admins(&self, admins: Vec<UserId>) {
        self.with(|r| r.chat_admins = admins);
    }

    pub fn fail_restrict(&self, fail: bool) {
        self.with(|r| r.fail_restrict = fail);
    }

    pub fn fail_remove(&self, fail: bool) {
        self.with(|r| r.fail_remove = fail);
    }

    pub fn fail_admin_fetch(&self, fail: bool) {
        self.with(|r| r.fail_admin_fetch = fail);
    }

    pub fn admin_fetches(&self) -> usize {
        self.with(|r| r.admin_fetches)
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId> {
        Ok(self.record_sent(Call::Text {
            chat,
            text: text.to_string(),
        }))
    }

    async fn send_challenge(
        &self,
        chat: ChatId,
        text: &str,
        _button: &str,
        payload: &str,
    ) -> Result<MessageId> {
        Ok(self.record_sent(Call::Challenge {
            chat,
            text: text.to_string(),
            payload: payload.to_string(),
        }))
    }

    async fn send_menu(&self, chat: ChatId, text: &str, _rows: &[&[&str]]) -> Result<MessageId> {
        Ok(self.record_sent(Call::Menu {
            chat,
            text: text.to_string(),
        }))
    }

    async fn send_document(&self, chat: ChatId, path: &Path, _caption: &str) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        self.with(|r| r.calls.push(Call::Document { chat, file_name }));
        Ok(())
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()> {
        self.with(|r| r.calls.push(Call::Delete { chat, message }));
        Ok(())
    }

    async fn restrict_member(&self, chat: ChatId, user: UserId, perms: Permissions) -> Result<()> {
        self.with(|r| {
            r.calls.push(Call::Restrict { chat, user, perms });
            if r.fail_restrict {
                Err(anyhow!("not enough rights to restrict"))
            } else {
                Ok(())
            }
        })
    }

    async fn remove_member(&self, chat: ChatId, user: UserId) -> Result<()> {
        self.with(|r| {
            r.calls.push(Call::Remove { chat, user });
            if r.fail_remove {
                Err(anyhow!("not enough rights to ban"))
            } else {
                Ok(())
            }
        })
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        self.with(|r| {
            r.calls.push(Call::Answer {
                callback_id: callback_id.to_string(),
                text: text.to_string(),
            })
        });
        Ok(())
    }

    async fn chat_administrators(&self, _chat: ChatId) -> Result<Vec<UserId>> {
        self.with(|r| {
            r.admin_fetches += 1;
            if r.fail_admin_fetch {
                Err(anyhow!("chat not found"))
            } else {
                Ok(r.chat_admins.clone())
            }
        })
    }
}

pub struct TestBed {
    pub app: Arc<App>,
    pub transport: Arc<RecordingTransport>,
    _dir: TempDir,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.admins = vec![ADMIN];
        cfg.runtime.data_dir = dir.path().to_string_lossy().into_owned();
        tweak(&mut cfg);

        let transport = Arc::new(RecordingTransport::default());
        let me = BotIdentity {
            id: UserId(BOT_ID),
            username: BOT_USERNAME.to_string(),
        };
        let app = App::new(cfg, transport.clone(), me).unwrap();
        Self {
            app,
            transport,
            _dir: dir,
        }
    }

    /// Runs a message through the full pipeline after stepping past the
    /// rate-limit window.
    pub async fn handle(&self, msg: InboundMessage) {
        tokio::time::advance(Duration::from_secs(2)).await;
        handlers::handle_message(&self.app, msg).await.unwrap();
    }
}

pub fn member(uid: u64) -> Sender {
    Sender {
        id: UserId(uid),
        is_bot: false,
        first_name: format!("user{uid}"),
        username: None,
        language_code: Some("en".into()),
    }
}

pub fn bot_member(uid: u64) -> Sender {
    Sender {
        is_bot: true,
        username: Some(format!("bot{uid}")),
        ..member(uid)
    }
}

pub fn private_message(uid: u64, text: &str) -> InboundMessage {
    InboundMessage {
        sender: member(uid),
        chat_id: ChatId(uid as i64),
        chat_kind: ChatKind::Private,
        text: text.to_string(),
        message_id: MessageId(next_inbound_id()),
    }
}

pub fn group_message(uid: u64, text: &str) -> InboundMessage {
    InboundMessage {
        sender: member(uid),
        chat_id: GROUP,
        chat_kind: ChatKind::Group,
        text: text.to_string(),
        message_id: MessageId(next_inbound_id()),
    }
}

fn next_inbound_id() -> i32 {
    use std::sync::atomic::{AtomicI32, Ordering};
    static NEXT: AtomicI32 = AtomicI32::new(100_000);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

pub fn join(chat: ChatId, uid: u64) -> JoinEvent {
    JoinEvent {
        chat_id: chat,
        chat_kind: ChatKind::Group,
        members: vec![member(uid)],
    }
}

pub fn callback(uid: u64, chat: ChatId, payload: &str) -> CallbackEvent {
    CallbackEvent {
        callback_id: format!("cb-{uid}"),
        sender: member(uid),
        chat_id: Some(chat),
        message_id: None,
        payload: payload.to_string(),
    }
}

/// Lets spawned tasks that became ready run to completion. The short
/// sleeps only elapse once in-flight `spawn_blocking` store writes finish.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
