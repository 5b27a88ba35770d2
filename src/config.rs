use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::{path::Path, time::Duration};
use teloxide::types::{ChatId, UserId};

pub const TOKEN_ENV: &str = "TELEGRAM_BOT_TOKEN";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub bot: BotConfig,
    pub admins: Vec<u64>,
    /// Monitored group chat ids. Empty means every group the bot sits in.
    pub groups: Vec<i64>,
    pub features: Features,
    pub limits: Limits,
    pub rewards: Rewards,
    pub links: Vec<LinkEntry>,
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BotConfig {
    pub token: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Features {
    pub verification: bool,
    pub referral_rewards: bool,
    pub whitelist_phase: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            verification: true,
            referral_rewards: true,
            whitelist_phase: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Limits {
    pub verification_timeout_secs: u64,
    pub rate_limit_ms: u64,
    pub link_warning_secs: u64,
    pub shutdown_delay_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            verification_timeout_secs: 300,
            rate_limit_ms: 1000,
            link_warning_secs: 5,
            shutdown_delay_secs: 3,
        }
    }
}

impl Limits {
    pub fn verification_timeout(&self) -> Duration {
        Duration::from_secs(self.verification_timeout_secs)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_millis(self.rate_limit_ms)
    }

    pub fn link_warning(&self) -> Duration {
        Duration::from_secs(self.link_warning_secs)
    }

    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_secs(self.shutdown_delay_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Rewards {
    pub daily_amount: u64,
    pub referral_bonus: u64,
}

impl Default for Rewards {
    fn default() -> Self {
        Self {
            daily_amount: 15,
            referral_bonus: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinkEntry {
    pub label: String,
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    pub data_dir: String,
    pub snapshots: SnapshotRetention,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            snapshots: SnapshotRetention::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SnapshotRetention {
    pub max_files: Option<usize>,
    pub retention_days: Option<i64>,
    pub enable_daily_cleanup: bool,
    pub daily_cleanup_at: String,
}

impl Default for SnapshotRetention {
    fn default() -> Self {
        Self {
            max_files: Some(200),
            retention_days: Some(30),
            enable_daily_cleanup: true,
            daily_cleanup_at: "03:30".to_string(),
        }
    }
}

impl Config {
    pub fn is_admin(&self, uid: UserId) -> bool {
        self.admins.contains(&uid.0)
    }

    pub fn is_monitored(&self, chat_id: ChatId) -> bool {
        self.groups.is_empty() || self.groups.contains(&chat_id.0)
    }

    /// Token from the config file, falling back to the environment.
    pub fn resolve_token(&self) -> Result<String> {
        if let Some(t) = self.bot.token.as_ref().filter(|t| !t.trim().is_empty()) {
            return Ok(t.trim().to_string());
        }
        match std::env::var(TOKEN_ENV) {
            Ok(t) if !t.trim().is_empty() => Ok(t.trim().to_string()),
            _ => Err(anyhow!(
                "bot token missing: set bot.token in the config or {} in the environment",
                TOKEN_ENV
            )),
        }
    }
}

/// Reads the YAML config. A missing file at the default location yields the
/// defaults; an explicitly requested file must exist.
pub fn load_config(path: &Path, explicit: bool) -> Result<Config> {
    if !explicit && !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config: {}", path.display()))?;
    let cfg: Config = serde_yaml::from_str(&text).context("parse yaml")?;
    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> Result<()> {
    let t = cfg.limits.verification_timeout_secs;
    if !(5..=24 * 3600).contains(&t) {
        return Err(anyhow!(
            "limits.verification_timeout_secs={} out of range (5..=86400)",
            t
        ));
    }
    if cfg.rewards.daily_amount == 0 {
        return Err(anyhow!("rewards.daily_amount must be > 0"));
    }
    if parse_hhmm_utc(&cfg.runtime.snapshots.daily_cleanup_at).is_none() {
        return Err(anyhow!(
            "runtime.snapshots.daily_cleanup_at='{}' is not HH:MM",
            cfg.runtime.snapshots.daily_cleanup_at
        ));
    }
    if let Some(0) = cfg.runtime.snapshots.max_files {
        return Err(anyhow!("runtime.snapshots.max_files must be > 0"));
    }
    for l in &cfg.links {
        if !l.url.starts_with("http://") && !l.url.starts_with("https://") {
            return Err(anyhow!("link '{}' url must be http(s): {}", l.label, l.url));
        }
    }
    Ok(())
}

pub fn parse_hhmm_utc(s: &str) -> Option<(u32, u32)> {
    let parts: Vec<&str> = s.trim().split(':').collect();
    if parts.len() != 2 {
        return None;
    }
    let hh = parts[0].parse::<u32>().ok()?;
    let mm = parts[1].parse::<u32>().ok()?;
    if hh > 23 || mm > 59 {
        return None;
    }
    Some((hh, mm))
}

pub fn parse_config_arg(args: &[String]) -> Option<std::path::PathBuf> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--config" && i + 1 < args.len() {
            return Some(std::path::PathBuf::from(&args[i + 1]));
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.limits.verification_timeout_secs, 300);
        assert_eq!(cfg.limits.rate_limit_ms, 1000);
        assert_eq!(cfg.rewards.daily_amount, 15);
        assert!(cfg.features.verification);
        assert_eq!(cfg.runtime.data_dir, "./data");
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let yaml = r#"
admins: [42]
groups: [-100123]
limits:
  verification_timeout_secs: 60
features:
  referral_rewards: false
links:
  - label: Website
    url: https://elonium.ai
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.limits.verification_timeout_secs, 60);
        assert_eq!(cfg.limits.link_warning_secs, 5);
        assert!(!cfg.features.referral_rewards);
        assert!(cfg.features.whitelist_phase);
        assert!(cfg.is_admin(UserId(42)));
        assert!(!cfg.is_admin(UserId(7)));
        assert!(cfg.is_monitored(ChatId(-100123)));
        assert!(!cfg.is_monitored(ChatId(-100999)));
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn rejects_out_of_range_timeout() {
        let mut cfg = Config::default();
        cfg.limits.verification_timeout_secs = 2;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn rejects_bad_cleanup_time() {
        let mut cfg = Config::default();
        cfg.runtime.snapshots.daily_cleanup_at = "25:00".into();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn config_arg_is_found() {
        let args: Vec<String> = vec!["--config".into(), "bot.yaml".into()];
        assert_eq!(
            parse_config_arg(&args),
            Some(std::path::PathBuf::from("bot.yaml"))
        );
        assert_eq!(parse_config_arg(&["--config".to_string()]), None);
    }

    #[test]
    fn token_from_file_wins() {
        let mut cfg = Config::default();
        cfg.bot.token = Some(" 123:abc ".into());
        assert_eq!(cfg.resolve_token().unwrap(), "123:abc");
    }
}
