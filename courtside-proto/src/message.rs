//! Chat data model shared by the client pipeline and its collaborators.
//!
//! Identifiers are newtypes so that server-assigned ids, client correlation
//! ids and user ids can never be confused. Server message ids are UUID v7,
//! which makes them time-ordered and usable as a monotonic sync cursor.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum allowed text size of a single message in bytes (64 KB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Server-assigned identifier of a confirmed message (UUID v7, time-ordered).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated correlation id for a message that has not been
/// confirmed by the server yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TempId(Uuid);

impl TempId {
    /// Creates a fresh correlation id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TempId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "opt-{}", self.0)
    }
}

/// Identifies a user account.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this user id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of chat surface a conversation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextType {
    /// Chat attached to a game.
    Game,
    /// Chat attached to a bug report.
    Bug,
    /// Direct chat between two users.
    User,
    /// Group channel.
    Group,
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Game => write!(f, "GAME"),
            Self::Bug => write!(f, "BUG"),
            Self::User => write!(f, "USER"),
            Self::Group => write!(f, "GROUP"),
        }
    }
}

/// A conversation scope: the `(type, id)` pair identifying one chat surface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChatContext {
    /// Kind of chat surface.
    pub kind: ContextType,
    /// Identifier of the game, bug, user chat or group.
    pub id: String,
}

impl ChatContext {
    /// Creates a conversation scope.
    pub fn new(kind: ContextType, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ChatContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Message subtype (the chat "tab" a message belongs to).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatSubtype {
    /// Visible to everyone in the conversation.
    #[default]
    Public,
    /// Participants only.
    Private,
    /// Organizers only.
    Admins,
    /// Photo stream.
    Photos,
}

impl ChatSubtype {
    /// Normalizes an optional subtype: an absent subtype means [`ChatSubtype::Public`].
    #[must_use]
    pub fn normalize(subtype: Option<Self>) -> Self {
        subtype.unwrap_or_default()
    }
}

/// Error returned when a subtype string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown chat subtype: {0}")]
pub struct UnknownSubtype(pub String);

impl FromStr for ChatSubtype {
    type Err = UnknownSubtype;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "" | "PUBLIC" => Ok(Self::Public),
            "PRIVATE" => Ok(Self::Private),
            "ADMINS" => Ok(Self::Admins),
            "PHOTOS" => Ok(Self::Photos),
            _ => Err(UnknownSubtype(s.to_string())),
        }
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// What the user asked to send.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Text content, if any.
    #[serde(default)]
    pub text: Option<String>,
    /// Uploaded media URLs.
    #[serde(default)]
    pub media_urls: Vec<String>,
    /// Thumbnails matching `media_urls`.
    #[serde(default)]
    pub thumbnail_urls: Vec<String>,
    /// Message this one replies to.
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    /// Users mentioned in the text.
    #[serde(default)]
    pub mention_ids: Vec<UserId>,
    /// Chat tab; `None` means public.
    #[serde(default)]
    pub subtype: Option<ChatSubtype>,
}

/// Error returned when a payload fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Neither text nor media.
    #[error("message has no text and no media")]
    Empty,
    /// Text exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the text in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

impl MessagePayload {
    /// Creates a plain text payload.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Sets the message this payload replies to.
    #[must_use]
    pub fn with_reply_to(mut self, reply_to: MessageId) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Sets the mentioned users.
    #[must_use]
    pub fn with_mentions(mut self, mentions: impl IntoIterator<Item = UserId>) -> Self {
        self.mention_ids = mentions.into_iter().collect();
        self
    }

    /// Sets the chat tab.
    #[must_use]
    pub const fn with_subtype(mut self, subtype: ChatSubtype) -> Self {
        self.subtype = Some(subtype);
        self
    }

    /// Text content, with a missing text treated as empty.
    #[must_use]
    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or_default()
    }

    /// Normalized subtype of this payload.
    #[must_use]
    pub fn normalized_subtype(&self) -> ChatSubtype {
        ChatSubtype::normalize(self.subtype)
    }

    /// Mentioned users as an order-independent set.
    #[must_use]
    pub fn mention_set(&self) -> BTreeSet<&UserId> {
        self.mention_ids.iter().collect()
    }

    /// Validates this payload for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if there is neither non-blank text
    /// nor media, or [`ValidationError::TooLarge`] if the text exceeds
    /// [`MAX_MESSAGE_SIZE`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        let text = self.text_or_empty();
        if text.trim().is_empty() && self.media_urls.is_empty() {
            return Err(ValidationError::Empty);
        }
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(ValidationError::TooLarge {
                size: text.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(())
    }
}

/// A message as confirmed by the server (the authoritative stream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedMessage {
    /// Server-assigned id.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub context: ChatContext,
    /// Author; `None` for system messages.
    pub sender_id: Option<UserId>,
    /// Text content (empty for media-only messages).
    #[serde(default)]
    pub text: String,
    /// Chat tab.
    #[serde(default)]
    pub subtype: ChatSubtype,
    /// Message this one replies to.
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    /// Users mentioned in the text.
    #[serde(default)]
    pub mention_ids: Vec<UserId>,
    /// Attached media URLs.
    #[serde(default)]
    pub media_urls: Vec<String>,
    /// Server-side creation time.
    pub created_at: Timestamp,
}

impl ConfirmedMessage {
    /// Builds the confirmed form of `payload` as the server would store it.
    ///
    /// Used by in-process collaborators and tests that stand in for the
    /// message-creation call.
    #[must_use]
    pub fn from_payload(context: ChatContext, sender_id: UserId, payload: &MessagePayload) -> Self {
        Self {
            id: MessageId::new(),
            context,
            sender_id: Some(sender_id),
            text: payload.text_or_empty().to_string(),
            subtype: payload.normalized_subtype(),
            reply_to: payload.reply_to.clone(),
            mention_ids: payload.mention_ids.clone(),
            media_urls: payload.media_urls.clone(),
            created_at: Timestamp::now(),
        }
    }

    /// Mentioned users as an order-independent set.
    #[must_use]
    pub fn mention_set(&self) -> BTreeSet<&UserId> {
        self.mention_ids.iter().collect()
    }
}
