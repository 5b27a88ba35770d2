//! In-memory member registry.
//!
//! Keys are member identities as strings (the Telegram user id rendered in
//! decimal). Every mutation is atomic per identity; the caller persists the
//! whole collection after a successful mutation.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::RegistryError;

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserRecord {
    pub id: String,
    #[serde(alias = "first_name")]
    pub display_name: Option<String>,
    #[serde(alias = "username")]
    pub handle: Option<String>,
    #[serde(alias = "language_code")]
    pub locale_tag: Option<String>,
    pub wallet: Option<String>,
    pub total_rewards: u64,
    pub modules_completed: u64,
    pub invites: u64,
    pub referred_by: Option<String>,
    #[serde(alias = "lastActive")]
    pub last_active_date: Option<String>,
    #[serde(alias = "lastReward")]
    pub last_reward_date: Option<String>,
    pub verified: bool,
    pub registered_at: Option<String>,
    pub started_at: Option<String>,
}

impl UserRecord {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Self::default()
        }
    }

    fn apply_profile(&mut self, p: &Profile) -> bool {
        let before = (
            self.display_name.clone(),
            self.handle.clone(),
            self.locale_tag.clone(),
        );
        if p.display_name.is_some() {
            self.display_name = p.display_name.clone();
        }
        self.handle = p.handle.clone();
        if p.locale_tag.is_some() {
            self.locale_tag = p.locale_tag.clone();
        }
        before != (
            self.display_name.clone(),
            self.handle.clone(),
            self.locale_tag.clone(),
        )
    }
}

/// Display metadata observed on an inbound event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub display_name: Option<String>,
    pub handle: Option<String>,
    pub locale_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Referral {
    NotRequested,
    Accepted { referrer: String },
    Ignored(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub first_start: bool,
    pub referral: Referral,
}

pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

/// Solana-style base58 address, 32 to 44 characters.
pub fn is_valid_wallet(wallet: &str) -> bool {
    (32..=44).contains(&wallet.len()) && wallet.chars().all(|c| BASE58_ALPHABET.contains(c))
}

#[derive(Default)]
pub struct UserRegistry {
    users: DashMap<String, UserRecord>,
    wallets: DashMap<String, String>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: BTreeMap<String, UserRecord>) -> Self {
        let reg = Self::new();
        for (id, mut rec) in map {
            if rec.id.is_empty() {
                rec.id = id.clone();
            }
            if let Some(w) = rec.wallet.clone() {
                if let Some(prev) = reg.wallets.insert(w.clone(), id.clone()) {
                    warn!("wallet {} bound to both {} and {} on load", w, prev, id);
                }
            }
            reg.users.insert(id, rec);
        }
        reg
    }

    pub fn to_map(&self) -> BTreeMap<String, UserRecord> {
        self.users
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.users.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<UserRecord> {
        self.users.get(id).map(|r| r.clone())
    }

    pub fn is_verified(&self, id: &str) -> bool {
        self.users.get(id).map(|r| r.verified).unwrap_or(false)
    }

    /// Returns the record for `id`, creating a zero-valued one if absent.
    /// The boolean is true when the record was just created.
    pub fn get_or_create(&self, id: &str, profile: &Profile) -> (UserRecord, bool) {
        let mut created = false;
        let mut rec = self.users.entry(id.to_string()).or_insert_with(|| {
            created = true;
            UserRecord::new(id)
        });
        rec.apply_profile(profile);
        (rec.clone(), created)
    }

    /// Refreshes display metadata and the last-active day without touching
    /// counters. Returns whether the stored record changed.
    pub fn touch(&self, id: &str, profile: &Profile, today: NaiveDate) -> bool {
        let Some(mut rec) = self.users.get_mut(id) else {
            return false;
        };
        let mut changed = rec.apply_profile(profile);
        let day = day_key(today);
        if rec.last_active_date.as_deref() != Some(day.as_str()) {
            rec.last_active_date = Some(day);
            changed = true;
        }
        changed
    }

    pub fn set_verified(&self, id: &str, verified: bool) -> bool {
        match self.users.get_mut(id) {
            Some(mut rec) => {
                rec.verified = verified;
                true
            }
            None => false,
        }
    }

    pub fn register_wallet(
        &self,
        id: &str,
        wallet: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let wallet = wallet.trim();
        if !is_valid_wallet(wallet) {
            return Err(RegistryError::InvalidWallet);
        }
        let mut rec = self
            .users
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownMember(id.to_string()))?;
        if rec.wallet.is_some() {
            return Err(RegistryError::AlreadyRegistered);
        }
        match self.wallets.entry(wallet.to_string()) {
            Entry::Occupied(o) if o.get() != id => return Err(RegistryError::WalletTaken),
            Entry::Occupied(_) => return Err(RegistryError::AlreadyRegistered),
            Entry::Vacant(v) => {
                v.insert(id.to_string());
            }
        }
        rec.wallet = Some(wallet.to_string());
        rec.registered_at = Some(now.to_rfc3339());
        Ok(())
    }

    /// Credits the daily reward once per calendar day. Returns the new total.
    pub fn claim_reward(
        &self,
        id: &str,
        today: NaiveDate,
        amount: u64,
    ) -> Result<u64, RegistryError> {
        let day = day_key(today);
        let mut rec = self
            .users
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownMember(id.to_string()))?;
        if rec.last_reward_date.as_deref() == Some(day.as_str()) {
            return Err(RegistryError::AlreadyClaimed);
        }
        rec.total_rewards = rec.total_rewards.saturating_add(amount);
        rec.modules_completed = rec.modules_completed.saturating_add(1);
        rec.last_active_date = Some(day.clone());
        rec.last_reward_date = Some(day);
        Ok(rec.total_rewards)
    }

    pub fn can_claim(&self, id: &str, today: NaiveDate) -> Option<bool> {
        let day = day_key(today);
        self.users
            .get(id)
            .map(|r| r.last_reward_date.as_deref() != Some(day.as_str()))
    }

    /// Marks the first `/start` of `id` and, only then, binds the referrer.
    /// The referrer gets one invite plus `bonus` rewards.
    pub fn start(
        &self,
        id: &str,
        referrer: Option<&str>,
        now: DateTime<Utc>,
        bonus: u64,
    ) -> Result<StartOutcome, RegistryError> {
        let referrer_check = referrer.map(|r| {
            if r == id {
                Err("self-referral")
            } else if !self.users.contains_key(r) {
                Err("unknown referrer")
            } else {
                Ok(r.to_string())
            }
        });

        let referral = {
            let mut rec = self
                .users
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownMember(id.to_string()))?;
            if rec.started_at.is_some() {
                let referral = match referrer_check {
                    None => Referral::NotRequested,
                    Some(_) => Referral::Ignored("already started"),
                };
                return Ok(StartOutcome {
                    first_start: false,
                    referral,
                });
            }
            rec.started_at = Some(now.to_rfc3339());
            match referrer_check {
                None => Referral::NotRequested,
                Some(Err(why)) => Referral::Ignored(why),
                Some(Ok(_)) if rec.referred_by.is_some() => Referral::Ignored("already referred"),
                Some(Ok(r)) => {
                    rec.referred_by = Some(r.clone());
                    Referral::Accepted { referrer: r }
                }
            }
        };

        if let Referral::Accepted { referrer } = &referral {
            if let Some(mut parent) = self.users.get_mut(referrer) {
                parent.invites = parent.invites.saturating_add(1);
                parent.total_rewards = parent.total_rewards.saturating_add(bonus);
            }
        }

        Ok(StartOutcome {
            first_start: true,
            referral,
        })
    }

    /// All records ordered by identity.
    pub fn records(&self) -> Vec<UserRecord> {
        self.to_map().into_values().collect()
    }

    pub fn verified_count(&self) -> usize {
        self.users.iter().filter(|r| r.verified).count()
    }

    pub fn wallet_count(&self) -> usize {
        self.wallets.len()
    }
}
