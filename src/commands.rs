/// A parsed slash command with its typed argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start { referrer: Option<String> },
    Register { wallet: Option<String> },
    Help,
    Id,
    Reward,
    NextClaim,
    Stats,
    Invite,
    Learn,
    Links,
    ExportCsv,
    Whitelist,
    BackupList,
    Snapshot,
    Status,
    ToggleMaintenance,
    ToggleRegister,
    CloseWhitelist,
    OpenWhitelist,
    Shutdown,
    Restart,
    Unknown(String),
}

const REFERRAL_PREFIX: &str = "ref_";

impl Command {
    /// Parses `text` as a command. Returns `None` for plain text and for
    /// commands addressed to a different bot (`/cmd@otherbot`). Matching is
    /// case-sensitive.
    pub fn parse(text: &str, bot_username: &str) -> Option<Command> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let (head, arg) = match rest.split_once(char::is_whitespace) {
            Some((h, a)) => (h, a.trim()),
            None => (rest, ""),
        };
        let name = match head.split_once('@') {
            Some((n, target)) => {
                if !target.eq_ignore_ascii_case(bot_username) {
                    return None;
                }
                n
            }
            None => head,
        };
        if name.is_empty() {
            return None;
        }
        let arg = (!arg.is_empty()).then(|| arg.to_string());

        let cmd = match name {
            "start" => Command::Start {
                referrer: arg
                    .as_deref()
                    .and_then(|a| a.strip_prefix(REFERRAL_PREFIX))
                    .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
                    .map(str::to_string),
            },
            "register" => Command::Register { wallet: arg },
            "help" => Command::Help,
            "id" => Command::Id,
            "reward" => Command::Reward,
            "nextclaim" => Command::NextClaim,
            "stats" => Command::Stats,
            "invite" => Command::Invite,
            "learn" => Command::Learn,
            "links" => Command::Links,
            "exportcsv" => Command::ExportCsv,
            "whitelist" => Command::Whitelist,
            "backuplist" => Command::BackupList,
            "snapshot" => Command::Snapshot,
            "status" => Command::Status,
            "togglemaintenance" => Command::ToggleMaintenance,
            "toggleregister" => Command::ToggleRegister,
            "closewhitelist" => Command::CloseWhitelist,
            "openwhitelist" => Command::OpenWhitelist,
            "shutdown" => Command::Shutdown,
            "restart" => Command::Restart,
            other => Command::Unknown(other.to_string()),
        };
        Some(cmd)
    }

    pub fn is_admin_only(&self) -> bool {
        matches!(
            self,
            Command::ExportCsv
                | Command::Whitelist
                | Command::BackupList
                | Command::Snapshot
                | Command::Status
                | Command::ToggleMaintenance
                | Command::ToggleRegister
                | Command::CloseWhitelist
                | Command::OpenWhitelist
                | Command::Shutdown
                | Command::Restart
        )
    }
}

pub fn referral_payload(user_key: &str) -> String {
    format!("{}{}", REFERRAL_PREFIX, user_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT: &str = "EloniumBot";

    fn parse(t: &str) -> Option<Command> {
        Command::parse(t, BOT)
    }

    #[test]
    fn plain_commands() {
        assert_eq!(parse("/help"), Some(Command::Help));
        assert_eq!(parse("  /reward  "), Some(Command::Reward));
        assert_eq!(parse("/nextclaim"), Some(Command::NextClaim));
        assert_eq!(parse("/togglemaintenance"), Some(Command::ToggleMaintenance));
        assert_eq!(parse("hello"), None);
        assert_eq!(parse("/"), None);
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert_eq!(parse("/Help"), Some(Command::Unknown("Help".into())));
        assert_eq!(parse("/REWARD"), Some(Command::Unknown("REWARD".into())));
    }

    #[test]
    fn bot_suffix() {
        assert_eq!(parse("/stats@EloniumBot"), Some(Command::Stats));
        assert_eq!(parse("/stats@eloniumbot"), Some(Command::Stats));
        assert_eq!(parse("/stats@OtherBot"), None);
    }

    #[test]
    fn start_referral() {
        assert_eq!(
            parse("/start ref_12345"),
            Some(Command::Start {
                referrer: Some("12345".into())
            })
        );
        assert_eq!(parse("/start"), Some(Command::Start { referrer: None }));
        assert_eq!(parse("/start ref_"), Some(Command::Start { referrer: None }));
        assert_eq!(parse("/start ref_abc"), Some(Command::Start { referrer: None }));
        assert_eq!(parse("/start promo"), Some(Command::Start { referrer: None }));
        assert_eq!(referral_payload("77"), "ref_77");
    }

    #[test]
    fn register_argument() {
        assert_eq!(
            parse("/register  7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU "),
            Some(Command::Register {
                wallet: Some("7xKXtg2CW87d97TXJSDpbD5jBkheTqA83TZRuJosgAsU".into())
            })
        );
        assert_eq!(parse("/register"), Some(Command::Register { wallet: None }));
    }

    #[test]
    fn admin_only_set() {
        assert!(Command::Shutdown.is_admin_only());
        assert!(Command::ExportCsv.is_admin_only());
        assert!(!Command::Reward.is_admin_only());
        assert!(!Command::Unknown("x".into()).is_admin_only());
    }
}
