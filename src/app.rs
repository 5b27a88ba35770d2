use anyhow::Result;
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use std::{collections::HashSet, path::PathBuf, sync::Arc};
use teloxide::types::{ChatId, MessageId, UserId};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    events::Sender,
    gateway::Gateway,
    registry::UserRegistry,
    settings::{BotSettings, SettingsHandle},
    store::Store,
    transport::ChatTransport,
    verification::Verifier,
};

/// Exit status asking an external process manager to start us again.
pub const RESTART_EXIT_CODE: i32 = 75;

#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Shutdown,
    Restart,
}

impl ExitKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ExitKind::Shutdown => 0,
            ExitKind::Restart => RESTART_EXIT_CODE,
        }
    }
}

/// Everything a handler needs, shared behind an `Arc`.
pub struct App {
    pub cfg: Config,
    pub transport: Arc<dyn ChatTransport>,
    pub store: Store,
    pub registry: UserRegistry,
    pub settings: SettingsHandle,
    pub verifier: Verifier,
    pub gateway: Gateway,
    pub me: BotIdentity,
    chat_admins: DashMap<ChatId, HashSet<UserId>>,
    exit_tx: broadcast::Sender<ExitKind>,
}

impl App {
    pub fn new(
        cfg: Config,
        transport: Arc<dyn ChatTransport>,
        me: BotIdentity,
    ) -> Result<Arc<Self>> {
        let store = Store::new(&cfg.runtime.data_dir, cfg.runtime.snapshots.clone());
        let users = store.load_users();
        let settings = store.load_settings();
        info!(
            "loaded {} members from {}",
            users.len(),
            store.data_dir().display()
        );
        let (exit_tx, _) = broadcast::channel(4);
        let verifier = Verifier::new(cfg.limits.verification_timeout());
        let gateway = Gateway::new(cfg.limits.rate_limit())?;
        Ok(Arc::new(Self {
            registry: UserRegistry::from_map(users),
            settings: SettingsHandle::new(settings),
            store,
            verifier,
            gateway,
            transport,
            me,
            chat_admins: DashMap::new(),
            exit_tx,
            cfg,
        }))
    }

    pub fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    pub fn subscribe_exit(&self) -> broadcast::Receiver<ExitKind> {
        self.exit_tx.subscribe()
    }

    pub fn request_exit(&self, kind: ExitKind) {
        if self.exit_tx.send(kind).is_err() {
            warn!("exit requested ({:?}) but nobody is listening", kind);
        }
    }

    /// Configured bot administrator.
    pub fn is_admin(&self, uid: UserId) -> bool {
        self.cfg.is_admin(uid)
    }

    /// Bot administrator, or an administrator of `chat`.
    pub async fn is_chat_admin(&self, chat: ChatId, uid: UserId) -> bool {
        if self.is_admin(uid) {
            return true;
        }
        if !self.chat_admins.contains_key(&chat) {
            if let Err(e) = self.refresh_admins(chat).await {
                // Cached as empty until the periodic refresh succeeds.
                warn!("admin list of {:?} unavailable: {:?}", chat, e);
                self.chat_admins.entry(chat).or_default();
                return false;
            }
        }
        self.chat_admins
            .get(&chat)
            .map(|set| set.contains(&uid))
            .unwrap_or(false)
    }

    pub async fn refresh_admins(&self, chat: ChatId) -> Result<()> {
        let admins = self.transport.chat_administrators(chat).await?;
        self.chat_admins.insert(chat, admins.into_iter().collect());
        Ok(())
    }

    pub async fn refresh_known_admins(&self) {
        let chats: Vec<ChatId> = self.chat_admins.iter().map(|e| *e.key()).collect();
        for chat in chats {
            if let Err(e) = self.refresh_admins(chat).await {
                debug!("refresh_admins failed for {:?}: {:?}", chat, e);
            }
        }
    }

    /// Creates or refreshes the sender's record, persisting when it changed.
    pub async fn observe(self: &Arc<Self>, sender: &Sender) {
        let key = sender.key();
        let profile = sender.profile();
        let created = !self.registry.contains(&key) && self.registry.get_or_create(&key, &profile).1;
        let changed = self.registry.touch(&key, &profile, Self::today());
        if created || changed {
            self.persist_users().await;
        }
    }

    async fn blocking<T, F>(self: &Arc<Self>, what: &str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&App) -> T + Send + 'static,
    {
        let app = Arc::clone(self);
        match tokio::task::spawn_blocking(move || f(&app)).await {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("{} task failed: {:?}", what, e);
                None
            }
        }
    }

    pub async fn persist_users(self: &Arc<Self>) -> Option<PathBuf> {
        self.blocking("save users", |app| {
            app.store.save_users_with(|| app.registry.to_map())
        })
        .await
        .flatten()
    }

    pub async fn persist_settings(self: &Arc<Self>, settings: &BotSettings) -> bool {
        let settings = settings.clone();
        self.blocking("save settings", move |app| app.store.save_settings(&settings))
            .await
            .unwrap_or(false)
    }

    pub async fn persist_pending(self: &Arc<Self>) -> bool {
        self.blocking("save pending", |app| {
            app.store.save_pending_with(|| app.verifier.pending_list())
        })
        .await
        .unwrap_or(false)
    }

    pub async fn persist_all(self: &Arc<Self>) {
        self.persist_users().await;
        let settings = self.settings.get().await;
        self.persist_settings(&settings).await;
        self.persist_pending().await;
    }

    /// Sends a reply; failures are already logged by the transport.
    pub async fn reply(&self, chat: ChatId, text: &str) -> Option<MessageId> {
        self.transport.send_text(chat, text).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{member, TestBed, ADMIN, GROUP};

    #[tokio::test]
    async fn observe_creates_then_refreshes_profile() {
        let bed = TestBed::new();
        let mut alice = member(10);
        bed.app.observe(&alice).await;
        assert_eq!(bed.app.store.load_users()["10"].display_name.as_deref(), Some("user10"));
        let snapshots = bed.app.store.list_snapshots().len();

        bed.app.observe(&alice).await;
        assert_eq!(bed.app.store.list_snapshots().len(), snapshots);

        alice.username = Some("alice".into());
        bed.app.observe(&alice).await;
        let rec = bed.app.store.load_users()["10"].clone();
        assert_eq!(rec.handle.as_deref(), Some("alice"));
        assert_eq!(rec.total_rewards, 0);
    }

    #[tokio::test]
    async fn chat_admins_are_scoped_to_their_chat() {
        let bed = TestBed::new();
        bed.transport.set_chat_admins(vec![UserId(20)]);
        assert!(bed.app.is_chat_admin(GROUP, UserId(20)).await);
        assert!(!bed.app.is_chat_admin(GROUP, UserId(21)).await);
        assert!(!bed.app.is_admin(UserId(20)));
        assert!(bed.app.is_admin(UserId(ADMIN)));

        bed.transport.set_chat_admins(vec![]);
        assert!(bed.app.is_chat_admin(GROUP, UserId(20)).await);
        bed.app.refresh_known_admins().await;
        assert!(!bed.app.is_chat_admin(GROUP, UserId(20)).await);
    }

    #[tokio::test]
    async fn unreadable_admin_list_is_fetched_once() {
        let bed = TestBed::new();
        bed.transport.fail_admin_fetch(true);
        assert!(!bed.app.is_chat_admin(GROUP, UserId(20)).await);
        assert!(!bed.app.is_chat_admin(GROUP, UserId(20)).await);
        assert_eq!(bed.transport.admin_fetches(), 1);

        bed.transport.fail_admin_fetch(false);
        bed.transport.set_chat_admins(vec![UserId(20)]);
        bed.app.refresh_known_admins().await;
        assert!(bed.app.is_chat_admin(GROUP, UserId(20)).await);
        assert_eq!(bed.transport.admin_fetches(), 2);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(ExitKind::Shutdown.exit_code(), 0);
        assert_eq!(ExitKind::Restart.exit_code(), RESTART_EXIT_CODE);
    }
}
