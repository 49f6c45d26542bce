//! The event envelope that context filters are evaluated against.

use serde::{Deserialize, Serialize};

/// A single inbound event as seen by the context algebra.
///
/// Only the routing fields matter here; the message payload is carried in
/// `content` for listeners but never inspected by filters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub content: String,
}

impl Session {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            ..Default::default()
        }
    }

    pub fn with_self_id(mut self, id: impl Into<String>) -> Self {
        self.self_id = Some(id.into());
        self
    }

    pub fn with_user(mut self, id: impl Into<String>) -> Self {
        self.user_id = Some(id.into());
        self
    }

    pub fn with_guild(mut self, id: impl Into<String>) -> Self {
        self.guild_id = Some(id.into());
        self
    }

    pub fn with_channel(mut self, id: impl Into<String>) -> Self {
        self.channel_id = Some(id.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// A direct (private) session has no guild.
    pub fn is_direct(&self) -> bool {
        self.guild_id.is_none()
    }
}
