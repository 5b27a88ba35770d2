//! Outbound operations against the chat platform.
//!
//! Core logic talks to [`ChatTransport`]; [`TelegramTransport`] is the
//! teloxide-backed implementation used in production.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use teloxide::{
    prelude::*,
    requests::{HasPayload, Payload, Request},
    types::{
        ChatId, ChatPermissions, InlineKeyboardButton, InlineKeyboardMarkup, InputFile,
        KeyboardButton, KeyboardMarkup, MessageId, UserId,
    },
};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permissions {
    /// No posting, no invites, no pin or chat info changes.
    Restricted,
    Full,
}

impl Permissions {
    fn to_chat_permissions(self) -> ChatPermissions {
        match self {
            Permissions::Restricted => ChatPermissions::empty(),
            Permissions::Full => ChatPermissions::all(),
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId>;

    /// Sends `text` with a single inline button whose callback data is `payload`.
    async fn send_challenge(
        &self,
        chat: ChatId,
        text: &str,
        button: &str,
        payload: &str,
    ) -> Result<MessageId>;

    /// Sends `text` with a persistent reply keyboard.
    async fn send_menu(&self, chat: ChatId, text: &str, rows: &[&[&str]]) -> Result<MessageId>;

    async fn send_document(&self, chat: ChatId, path: &Path, caption: &str) -> Result<()>;

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()>;

    async fn restrict_member(&self, chat: ChatId, user: UserId, perms: Permissions) -> Result<()>;

    /// Removes the member while still allowing them to rejoin later.
    async fn remove_member(&self, chat: ChatId, user: UserId) -> Result<()>;

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()>;

    async fn chat_administrators(&self, chat: ChatId) -> Result<Vec<UserId>>;
}

fn ctx_perm_hint(ctx: &str) -> &'static str {
    match ctx {
        "restrict_chat_member" => "the bot must be a group admin with the Restrict members right",
        "ban_chat_member" | "unban_chat_member" => {
            "the bot must be a group admin with the Ban users right"
        }
        "delete_message" => "the bot must be a group admin with the Delete messages right",
        "get_chat_administrators" => "the bot must be able to read the admin list of the chat",
        "send_message" | "send_document" => {
            "the bot must be allowed to post in the chat; in private chats the user may have blocked it"
        }
        "answer_callback_query" => "callback answers rarely fail; usually a network error or an expired query",
        _ => "check that the bot is a group admin with the matching rights",
    }
}

async fn api_call<R>(ctx: &str, req: R) -> Result<<R::Payload as Payload>::Output>
where
    R: Request + HasPayload,
    R::Err: std::error::Error + Send + Sync + 'static,
{
    match req.send().await {
        Ok(v) => Ok(v),
        Err(e) => {
            warn!(
                "API call failed ({ctx}): {:?}; hint: {}",
                e,
                ctx_perm_hint(ctx)
            );
            Err(e.into())
        }
    }
}

#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(&self, chat: ChatId, text: &str) -> Result<MessageId> {
        let msg = api_call("send_message", self.bot.send_message(chat, text)).await?;
        Ok(msg.id)
    }

    async fn send_challenge(
        &self,
        chat: ChatId,
        text: &str,
        button: &str,
        payload: &str,
    ) -> Result<MessageId> {
        let kb = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::callback(
            button.to_string(),
            payload.to_string(),
        )]]);
        let msg = api_call(
            "send_message",
            self.bot.send_message(chat, text).reply_markup(kb),
        )
        .await?;
        Ok(msg.id)
    }

    async fn send_menu(&self, chat: ChatId, text: &str, rows: &[&[&str]]) -> Result<MessageId> {
        let keyboard: Vec<Vec<KeyboardButton>> = rows
            .iter()
            .map(|row| row.iter().map(|label| KeyboardButton::new(*label)).collect())
            .collect();
        let kb = KeyboardMarkup::new(keyboard).resize_keyboard();
        let msg = api_call(
            "send_message",
            self.bot.send_message(chat, text).reply_markup(kb),
        )
        .await?;
        Ok(msg.id)
    }

    async fn send_document(&self, chat: ChatId, path: &Path, caption: &str) -> Result<()> {
        api_call(
            "send_document",
            self.bot
                .send_document(chat, InputFile::file(path.to_path_buf()))
                .caption(caption),
        )
        .await?;
        Ok(())
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()> {
        api_call("delete_message", self.bot.delete_message(chat, message)).await?;
        Ok(())
    }

    async fn restrict_member(&self, chat: ChatId, user: UserId, perms: Permissions) -> Result<()> {
        api_call(
            "restrict_chat_member",
            self.bot
                .restrict_chat_member(chat, user, perms.to_chat_permissions()),
        )
        .await?;
        Ok(())
    }

    async fn remove_member(&self, chat: ChatId, user: UserId) -> Result<()> {
        api_call("ban_chat_member", self.bot.ban_chat_member(chat, user)).await?;
        api_call(
            "unban_chat_member",
            self.bot.unban_chat_member(chat, user).only_if_banned(true),
        )
        .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        api_call(
            "answer_callback_query",
            self.bot.answer_callback_query(callback_id).text(text),
        )
        .await?;
        Ok(())
    }

    async fn chat_administrators(&self, chat: ChatId) -> Result<Vec<UserId>> {
        let admins = api_call(
            "get_chat_administrators",
            self.bot.get_chat_administrators(chat),
        )
        .await?;
        Ok(admins.into_iter().map(|m| m.user.id).collect())
    }
}
