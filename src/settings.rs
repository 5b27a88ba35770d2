use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Process-wide switches flipped by admin commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BotSettings {
    pub maintenance_mode: bool,
    pub registration_enabled: bool,
    pub whitelist_closed: bool,
    pub last_snapshot_at: Option<DateTime<Utc>>,
    pub process_started_at: Option<DateTime<Utc>>,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            maintenance_mode: false,
            registration_enabled: true,
            whitelist_closed: false,
            last_snapshot_at: None,
            process_started_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggle {
    Maintenance,
    Registration,
    CloseWhitelist,
    OpenWhitelist,
}

pub struct SettingsHandle {
    inner: RwLock<BotSettings>,
}

impl SettingsHandle {
    pub fn new(settings: BotSettings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    pub async fn get(&self) -> BotSettings {
        self.inner.read().await.clone()
    }

    pub async fn maintenance(&self) -> bool {
        self.inner.read().await.maintenance_mode
    }

    /// Applies the toggle and returns the resulting settings for persisting.
    pub async fn apply(&self, t: Toggle) -> BotSettings {
        let mut s = self.inner.write().await;
        match t {
            Toggle::Maintenance => s.maintenance_mode = !s.maintenance_mode,
            Toggle::Registration => s.registration_enabled = !s.registration_enabled,
            Toggle::CloseWhitelist => s.whitelist_closed = true,
            Toggle::OpenWhitelist => s.whitelist_closed = false,
        }
        s.clone()
    }

    pub async fn mark_snapshot(&self, at: DateTime<Utc>) -> BotSettings {
        let mut s = self.inner.write().await;
        s.last_snapshot_at = Some(at);
        s.clone()
    }

    pub async fn mark_started(&self, at: DateTime<Utc>) -> BotSettings {
        let mut s = self.inner.write().await;
        s.process_started_at = Some(at);
        s.clone()
    }
}
