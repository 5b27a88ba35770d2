use thiserror::Error;

/// Rejections raised by registry mutations. Each maps to a user-facing reply
/// and guarantees the record was left untouched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("wallet address is malformed")]
    InvalidWallet,

    #[error("a wallet is already registered to this account")]
    AlreadyRegistered,

    #[error("wallet address is already registered by another member")]
    WalletTaken,

    #[error("reward already claimed today")]
    AlreadyClaimed,

    #[error("member {0} is unknown")]
    UnknownMember(String),
}

impl RegistryError {
    pub fn reply_text(&self) -> &'static str {
        match self {
            RegistryError::InvalidWallet => "❌ Please provide a valid wallet address.",
            RegistryError::AlreadyRegistered => "ℹ️ You are already registered. A wallet can only be set once.",
            RegistryError::WalletTaken => "❌ This wallet address is already registered by another user.",
            RegistryError::AlreadyClaimed => "🕒 Already claimed today. Come back tomorrow!",
            RegistryError::UnknownMember(_) => "❌ You need to /start first.",
        }
    }
}
