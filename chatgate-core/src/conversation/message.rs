//! Chat messages

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ConversationConfig;
use crate::error::{ChatError, Result};

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Token usage reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Image attached to a user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub media_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl ImageAttachment {
    /// Decode and check an inbound base64 image.
    ///
    /// Accepts either raw base64 or a `data:<mime>;base64,` URL. The media
    /// type must be allow-listed and the decoded size within
    /// `max_image_bytes`.
    pub fn from_base64(
        media_type: &str,
        encoded: &str,
        config: &ConversationConfig,
    ) -> Result<Self> {
        let media_type = media_type.trim().to_ascii_lowercase();
        if !config
            .allowed_image_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&media_type))
        {
            return Err(ChatError::ValidationError(format!(
                "Unsupported image type: {media_type}"
            )));
        }

        let payload = match encoded.split_once(";base64,") {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => encoded,
        };
        let payload = payload.trim();

        // base64 inflates by 4/3; reject obviously oversized input before
        // decoding it.
        if payload.len() / 4 * 3 > config.max_image_bytes + 3 {
            return Err(oversized(config.max_image_bytes));
        }

        let data = STANDARD
            .decode(payload)
            .map_err(|e| ChatError::ValidationError(format!("Image is not valid base64: {e}")))?;
        if data.is_empty() {
            return Err(ChatError::ValidationError("Image is empty".to_string()));
        }
        if data.len() > config.max_image_bytes {
            return Err(oversized(config.max_image_bytes));
        }

        Ok(Self { media_type, data })
    }

    /// `data:` URL as embedded in multimodal provider requests
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, STANDARD.encode(&self.data))
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

fn oversized(limit: usize) -> ChatError {
    ChatError::ValidationError(format!("Image exceeds the {limit} byte limit"))
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// A message in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAttachment>,
    /// Set on assistant messages only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            image: None,
            model: None,
            timestamp: Utc::now(),
            usage: None,
            response_time_ms: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn assistant(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::new(Role::Assistant, content)
        }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_usage(mut self, usage: Option<TokenUsage>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_response_time_ms(mut self, millis: u64) -> Self {
        self.response_time_ms = Some(millis);
        self
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConversationConfig {
        ConversationConfig {
            max_image_bytes: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_image_accepts_raw_and_data_url() {
        let raw = ImageAttachment::from_base64("image/png", "aGVsbG8=", &config()).unwrap();
        assert_eq!(raw.data, b"hello");
        assert_eq!(raw.data_url(), "data:image/png;base64,aGVsbG8=");

        let url =
            ImageAttachment::from_base64("IMAGE/JPEG", "data:image/jpeg;base64,aGVsbG8=", &config())
                .unwrap();
        assert_eq!(url.media_type, "image/jpeg");
        assert_eq!(url.size_bytes(), 5);
    }

    #[test]
    fn test_image_rejects_unlisted_type() {
        let err = ImageAttachment::from_base64("image/tiff", "aGVsbG8=", &config()).unwrap_err();
        assert!(matches!(err, ChatError::ValidationError(_)));
    }

    #[test]
    fn test_image_rejects_oversized_and_garbage() {
        let big = STANDARD.encode([0u8; 17]);
        assert!(ImageAttachment::from_base64("image/png", &big, &config()).is_err());
        assert!(ImageAttachment::from_base64("image/png", "***", &config()).is_err());
        assert!(ImageAttachment::from_base64("image/png", "", &config()).is_err());
    }

    #[test]
    fn test_model_only_on_assistant() {
        assert!(Message::user("hi").model.is_none());
        assert_eq!(
            Message::assistant("hello", "m/x").model.as_deref(),
            Some("m/x")
        );
    }

    #[test]
    fn test_message_json_shape() {
        let message = Message::user("hi").with_image(ImageAttachment {
            media_type: "image/png".to_string(),
            data: b"hello".to_vec(),
        });
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["image"]["data"], "aGVsbG8=");
        assert!(json.get("model").is_none());

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }
}
