use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SCHEME_TEL: &str = "tel";
pub const SCHEME_WHATSAPP: &str = "whatsapp";
pub const SCHEME_TELEGRAM: &str = "telegram";
pub const SCHEME_FRESHCHAT: &str = "freshchat";

/// A contact endpoint in `scheme:path` form. Always normalized: construct
/// one through the scheme constructors or `Urn::parse`, never from raw
/// strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Urn(String);

impl Urn {
    pub fn parse(value: &str) -> Result<Urn> {
        let (scheme, path) = value
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid urn: {}", value))?;
        Urn::from_parts(scheme, path)
    }

    pub fn from_parts(scheme: &str, path: &str) -> Result<Urn> {
        let scheme = scheme.trim().to_lowercase();
        match scheme.as_str() {
            SCHEME_TEL => Urn::from_tel(path),
            SCHEME_WHATSAPP => Urn::from_whatsapp(path),
            SCHEME_TELEGRAM => Urn::from_telegram(path),
            SCHEME_FRESHCHAT => Urn::from_freshchat(path),
            "" => Err(anyhow!("urn scheme cannot be empty")),
            _ => {
                let path = path.trim();
                if path.is_empty() {
                    return Err(anyhow!("urn path cannot be empty"));
                }
                Ok(Urn(format!("{}:{}", scheme, path)))
            }
        }
    }

    /// Phone number, canonicalized toward E.164: punctuation stripped and a
    /// leading `+` enforced for anything longer than a national short code.
    pub fn from_tel(number: &str) -> Result<Urn> {
        let plus = number.trim_start().starts_with('+');
        let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(anyhow!("invalid phone number: {}", number));
        }
        let path = if plus || digits.len() > 7 {
            format!("+{}", digits)
        } else {
            digits
        };
        Ok(Urn(format!("{}:{}", SCHEME_TEL, path)))
    }

    /// WhatsApp identifiers are bare digit strings, no leading `+`.
    pub fn from_whatsapp(number: &str) -> Result<Urn> {
        let digits: String = number.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Err(anyhow!("invalid whatsapp number: {}", number));
        }
        Ok(Urn(format!("{}:{}", SCHEME_WHATSAPP, digits)))
    }

    /// Telegram chat ids are integers, negative for group chats.
    pub fn from_telegram(chat_id: &str) -> Result<Urn> {
        let trimmed = chat_id.trim();
        let _: i64 = trimmed
            .parse()
            .map_err(|_| anyhow!("invalid telegram chat id: {}", chat_id))?;
        Ok(Urn(format!("{}:{}", SCHEME_TELEGRAM, trimmed)))
    }

    /// Freshchat endpoints are `<channel_id>/<actor_id>`, both UUID-shaped.
    pub fn from_freshchat(path: &str) -> Result<Urn> {
        let path = path.trim().to_lowercase();
        let (channel_id, actor_id) = path
            .split_once('/')
            .ok_or_else(|| anyhow!("invalid freshchat identifier: {}", path))?;
        if channel_id.is_empty() || actor_id.is_empty() {
            return Err(anyhow!("invalid freshchat identifier: {}", path));
        }
        Ok(Urn(format!("{}:{}", SCHEME_FRESHCHAT, path)))
    }

    pub fn scheme(&self) -> &str {
        self.0.split_once(':').map(|(s, _)| s).unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.0.split_once(':').map(|(_, p)| p).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
