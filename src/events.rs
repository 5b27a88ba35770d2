use teloxide::types::{CallbackQuery, ChatId, Message, MessageId, User, UserId};

use crate::registry::Profile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
    Channel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: UserId,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
    pub language_code: Option<String>,
}

impl Sender {
    pub fn key(&self) -> String {
        self.id.0.to_string()
    }

    pub fn profile(&self) -> Profile {
        Profile {
            display_name: Some(self.first_name.clone()),
            handle: self.username.clone(),
            locale_tag: self.language_code.clone(),
        }
    }

    pub fn mention(&self) -> String {
        match &self.username {
            Some(u) => format!("@{}", u),
            None => self.first_name.clone(),
        }
    }
}

impl From<&User> for Sender {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            is_bot: u.is_bot,
            first_name: u.first_name.clone(),
            username: u.username.clone(),
            language_code: u.language_code.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub sender: Sender,
    pub chat_id: ChatId,
    pub chat_kind: ChatKind,
    pub text: String,
    pub message_id: MessageId,
}

impl InboundMessage {
    pub fn from_message(msg: &Message) -> Option<Self> {
        let from = msg.from.as_ref()?;
        let text = msg.text().or_else(|| msg.caption())?;
        Some(Self {
            sender: Sender::from(from),
            chat_id: msg.chat.id,
            chat_kind: chat_kind(msg),
            text: text.to_string(),
            message_id: msg.id,
        })
    }

    pub fn is_group(&self) -> bool {
        self.chat_kind == ChatKind::Group
    }
}

#[derive(Debug, Clone)]
pub struct JoinEvent {
    pub chat_id: ChatId,
    pub chat_kind: ChatKind,
    pub members: Vec<Sender>,
}

impl JoinEvent {
    pub fn from_message(msg: &Message) -> Option<Self> {
        let members = msg.new_chat_members()?;
        Some(Self {
            chat_id: msg.chat.id,
            chat_kind: chat_kind(msg),
            members: members.iter().map(Sender::from).collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CallbackEvent {
    pub callback_id: String,
    pub sender: Sender,
    pub chat_id: Option<ChatId>,
    pub message_id: Option<MessageId>,
    pub payload: String,
}

impl CallbackEvent {
    pub fn from_query(q: &CallbackQuery) -> Option<Self> {
        let payload = q.data.clone()?;
        Some(Self {
            callback_id: q.id.clone(),
            sender: Sender::from(&q.from),
            chat_id: q.message.as_ref().map(|m| m.chat().id),
            message_id: q.message.as_ref().map(|m| m.id()),
            payload,
        })
    }
}

fn chat_kind(msg: &Message) -> ChatKind {
    if msg.chat.is_private() {
        ChatKind::Private
    } else if msg.chat.is_channel() {
        ChatKind::Channel
    } else {
        ChatKind::Group
    }
}
