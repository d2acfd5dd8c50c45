//! Canonical route keys: the string form stored in `bindings.route_key` and
//! the typed coordinates each provider client works with.
//!
//! Grammars:
//! - `telegram:<account>:chat:<chatId>[:topic:<topicId>]`
//! - `discord:<account>:dm:user:<userId>`
//! - `discord:<account>:guild:<guildId>[:channel:<channelId>][:thread:<threadId>]`
//! - `whatsapp:<account>:chat:<chatJid>`

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Telegram,
    Discord,
    WhatsApp,
}

impl Channel {
    pub fn parse(s: &str) -> Option<Channel> {
        match s {
            "telegram" => Some(Channel::Telegram),
            "discord" => Some(Channel::Discord),
            "whatsapp" => Some(Channel::WhatsApp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Telegram => "telegram",
            Channel::Discord => "discord",
            Channel::WhatsApp => "whatsapp",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramRoute {
    pub account: String,
    pub chat_id: String,
    pub topic_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscordTarget {
    Dm {
        user_id: String,
    },
    Guild {
        guild_id: String,
        channel_id: Option<String>,
        thread_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscordRoute {
    pub account: String,
    pub target: DiscordTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhatsAppRoute {
    pub account: String,
    pub chat_jid: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Telegram(TelegramRoute),
    Discord(DiscordRoute),
    WhatsApp(WhatsAppRoute),
}

impl Route {
    pub fn channel(&self) -> Channel {
        match self {
            Route::Telegram(_) => Channel::Telegram,
            Route::Discord(_) => Channel::Discord,
            Route::WhatsApp(_) => Channel::WhatsApp,
        }
    }

    /// Rebuild the canonical string form. `parse_route_key(r.to_key())` is the
    /// identity for every route this module can produce.
    pub fn to_key(&self) -> String {
        match self {
            Route::Telegram(t) => match &t.topic_id {
                Some(topic) => format!("telegram:{}:chat:{}:topic:{}", t.account, t.chat_id, topic),
                None => format!("telegram:{}:chat:{}", t.account, t.chat_id),
            },
            Route::Discord(d) => match &d.target {
                DiscordTarget::Dm { user_id } => {
                    format!("discord:{}:dm:user:{}", d.account, user_id)
                }
                DiscordTarget::Guild {
                    guild_id,
                    channel_id,
                    thread_id,
                } => {
                    let mut key = format!("discord:{}:guild:{}", d.account, guild_id);
                    if let Some(c) = channel_id {
                        key.push_str(&format!(":channel:{c}"));
                    }
                    if let Some(t) = thread_id {
                        key.push_str(&format!(":thread:{t}"));
                    }
                    key
                }
            },
            Route::WhatsApp(w) => format!("whatsapp:{}:chat:{}", w.account, w.chat_jid),
        }
    }
}

/// Parse a canonical route key. Returns None for anything that does not match
/// a grammar exactly (unknown provider, missing segments, trailing garbage).
pub fn parse_route_key(key: &str) -> Option<Route> {
    let parts: Vec<&str> = key.split(':').collect();
    match parts.as_slice() {
        ["telegram", account, "chat", chat_id] if is_signed_numeric(chat_id) => {
            Some(Route::Telegram(TelegramRoute {
                account: account.to_string(),
                chat_id: chat_id.to_string(),
                topic_id: None,
            }))
        }
        ["telegram", account, "chat", chat_id, "topic", topic_id]
            if is_signed_numeric(chat_id) && is_unsigned_numeric(topic_id) =>
        {
            Some(Route::Telegram(TelegramRoute {
                account: account.to_string(),
                chat_id: chat_id.to_string(),
                topic_id: Some(topic_id.to_string()),
            }))
        }
        ["discord", account, "dm", "user", user_id] if is_unsigned_numeric(user_id) => {
            Some(Route::Discord(DiscordRoute {
                account: account.to_string(),
                target: DiscordTarget::Dm {
                    user_id: user_id.to_string(),
                },
            }))
        }
        ["discord", account, "guild", guild_id] if is_unsigned_numeric(guild_id) => {
            Some(Route::Discord(DiscordRoute {
                account: account.to_string(),
                target: DiscordTarget::Guild {
                    guild_id: guild_id.to_string(),
                    channel_id: None,
                    thread_id: None,
                },
            }))
        }
        ["discord", account, "guild", guild_id, "channel", channel_id]
            if is_unsigned_numeric(guild_id) && is_unsigned_numeric(channel_id) =>
        {
            Some(Route::Discord(DiscordRoute {
                account: account.to_string(),
                target: DiscordTarget::Guild {
                    guild_id: guild_id.to_string(),
                    channel_id: Some(channel_id.to_string()),
                    thread_id: None,
                },
            }))
        }
        ["discord", account, "guild", guild_id, "channel", channel_id, "thread", thread_id]
            if is_unsigned_numeric(guild_id)
                && is_unsigned_numeric(channel_id)
                && is_unsigned_numeric(thread_id) =>
        {
            Some(Route::Discord(DiscordRoute {
                account: account.to_string(),
                target: DiscordTarget::Guild {
                    guild_id: guild_id.to_string(),
                    channel_id: Some(channel_id.to_string()),
                    thread_id: Some(thread_id.to_string()),
                },
            }))
        }
        ["whatsapp", account, "chat", chat_jid] if !chat_jid.is_empty() => {
            Some(Route::WhatsApp(WhatsAppRoute {
                account: account.to_string(),
                chat_jid: chat_jid.to_string(),
            }))
        }
        _ => None,
    }
}

/// Deterministic default session keys, used when the tenant did not name one.
/// Opaque to tenants but stable for a given provider destination.
pub fn telegram_session_key(chat_type: &str, chat_id: &str, topic_id: Option<&str>) -> String {
    match (chat_type, topic_id) {
        ("private", _) => format!("tg:dm:{chat_id}"),
        ("channel", _) => format!("tg:channel:{chat_id}"),
        (_, Some(topic)) => format!("tg:group:{chat_id}:thread:{topic}"),
        (_, None) => format!("tg:group:{chat_id}"),
    }
}

pub fn discord_session_key(target: &DiscordTarget) -> String {
    match target {
        DiscordTarget::Dm { user_id } => format!("dc:dm:{user_id}"),
        DiscordTarget::Guild {
            guild_id,
            channel_id,
            thread_id,
        } => {
            let mut key = format!("dc:guild:{guild_id}");
            if let Some(c) = channel_id {
                key.push_str(&format!(":channel:{c}"));
            }
            if let Some(t) = thread_id {
                key.push_str(&format!(":thread:{t}"));
            }
            key
        }
    }
}

pub fn whatsapp_session_key(chat_jid: &str) -> String {
    if chat_jid.ends_with("@g.us") {
        format!("wa:group:{chat_jid}")
    } else {
        format!("wa:dm:{chat_jid}")
    }
}

/// Digits with an optional leading minus (Telegram group ids are negative).
fn is_signed_numeric(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Digits only (snowflakes, topic ids).
fn is_unsigned_numeric(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}
