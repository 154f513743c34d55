//! Chat messages to peer message templates.
//!
//! The peer expects a flat list of `{role, content, attachments,
//! participantPosition}` objects. Multi-part OpenAI content is split into
//! text (joined with blank lines) and attachments; `developer` is treated as
//! `system`.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Position used for system messages regardless of battle target.
const SYSTEM_POSITION: &str = "b";

/// Position of the blank message added in bypass mode.
const BYPASS_POSITION: &str = "a";

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<MessageContent>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        #[serde(default)]
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageUrl {
    pub url: Option<String>,
    /// Some clients carry the original file name here.
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageTemplate {
    pub role: String,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub participant_position: String,
}

#[derive(Debug, Clone)]
pub struct TemplateOptions {
    /// Merge all system messages into one leading system message.
    pub tavern_mode: bool,
    /// Append a blank user message at position `a`.
    pub bypass_sensitivity: bool,
    /// `A` or `B`; lowercased into the participant position.
    pub battle_target: String,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            tavern_mode: false,
            bypass_sensitivity: false,
            battle_target: "A".to_string(),
        }
    }
}

struct Processed {
    role: String,
    content: String,
    attachments: Vec<Attachment>,
}

pub fn build_templates(messages: &[ChatMessage], options: &TemplateOptions) -> Vec<MessageTemplate> {
    let mut processed: Vec<Processed> = messages.iter().map(process_message).collect();

    if options.tavern_mode {
        let (system, rest): (Vec<Processed>, Vec<Processed>) =
            processed.into_iter().partition(|m| m.role == "system");
        processed = Vec::with_capacity(rest.len() + 1);
        if !system.is_empty() {
            let merged: Vec<String> = system.into_iter().map(|m| m.content).collect();
            processed.push(Processed {
                role: "system".to_string(),
                content: merged.join("\n\n"),
                attachments: Vec::new(),
            });
        }
        processed.extend(rest);
    }

    let position = options.battle_target.to_lowercase();
    let mut templates: Vec<MessageTemplate> = processed
        .into_iter()
        .map(|m| {
            let participant_position = if m.role == "system" {
                SYSTEM_POSITION.to_string()
            } else {
                position.clone()
            };
            MessageTemplate {
                role: m.role,
                content: m.content,
                attachments: m.attachments,
                participant_position,
            }
        })
        .collect();

    if options.bypass_sensitivity {
        templates.push(MessageTemplate {
            role: "user".to_string(),
            content: " ".to_string(),
            attachments: Vec::new(),
            participant_position: BYPASS_POSITION.to_string(),
        });
    }

    debug!(count = templates.len(), "Built message templates");
    templates
}

fn process_message(message: &ChatMessage) -> Processed {
    let role = if message.role == "developer" {
        "system".to_string()
    } else {
        message.role.clone()
    };

    let mut attachments = Vec::new();
    let mut content = match &message.content {
        None => String::new(),
        Some(MessageContent::Text(text)) => text.clone(),
        Some(MessageContent::Parts(parts)) => {
            let mut texts = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => texts.push(text.as_str()),
                    ContentPart::ImageUrl { image_url } => {
                        if let Some(attachment) = attachment_from(image_url) {
                            attachments.push(attachment);
                        }
                    }
                    ContentPart::Unsupported => {}
                }
            }
            texts.join("\n\n")
        }
    };

    if role == "user" && content.trim().is_empty() {
        content = " ".to_string();
    }

    Processed {
        role,
        content,
        attachments,
    }
}

fn attachment_from(image: &ImageUrl) -> Option<Attachment> {
    let url = image.url.as_deref().filter(|u| !u.is_empty())?;
    let content_type = if let Some(rest) = url.strip_prefix("data:") {
        match rest.split(';').next().filter(|t| t.contains('/')) {
            Some(t) => t.to_string(),
            None => {
                let preview: String = url.chars().take(60).collect();
                warn!("Skipping attachment with unreadable data URL: {preview}...");
                return None;
            }
        }
    } else {
        guess_type(url).to_string()
    };
    let name = match image.detail.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => generated_name(&content_type),
    };
    Some(Attachment {
        name,
        content_type,
        url: url.to_string(),
    })
}

const KNOWN_TYPES: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("mp4", "video/mp4"),
    ("pdf", "application/pdf"),
    ("txt", "text/plain"),
    ("json", "application/json"),
    ("bin", "application/octet-stream"),
];

fn guess_type(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    KNOWN_TYPES
        .iter()
        .find(|(e, _)| *e == ext)
        .map_or("application/octet-stream", |&(_, t)| t)
}

fn generated_name(content_type: &str) -> String {
    let prefix = match content_type.split('/').next() {
        Some("image") => "image",
        Some("audio") => "audio",
        _ => "file",
    };
    let ext = KNOWN_TYPES
        .iter()
        .find(|(_, t)| *t == content_type)
        .map_or("png", |&(e, _)| e);
    format!("{prefix}_{}.{ext}", uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(value: serde_json::Value) -> Vec<ChatMessage> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn developer_becomes_system_and_positions_follow_target() {
        let msgs = messages(serde_json::json!([
            {"role": "developer", "content": "be brief"},
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
        ]));
        let options = TemplateOptions {
            battle_target: "B".into(),
            ..TemplateOptions::default()
        };
        let t = build_templates(&msgs, &options);
        assert_eq!(t[0].role, "system");
        assert_eq!(t[0].participant_position, "b");
        assert_eq!(t[1].participant_position, "b");
        assert_eq!(t[2].participant_position, "b");

        let t = build_templates(&msgs, &TemplateOptions::default());
        assert_eq!(t[1].participant_position, "a");
    }

    #[test]
    fn parts_split_into_text_and_attachments() {
        let msgs = messages(serde_json::json!([{
            "role": "user",
            "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,AAAA"}},
                {"type": "text", "text": "at this"},
                {"type": "image_url", "image_url": {"url": "https://x/cat.PNG?s=1", "detail": "cat.png"}},
                {"type": "input_audio"},
            ]
        }]));
        let t = build_templates(&msgs, &TemplateOptions::default());
        assert_eq!(t[0].content, "look\n\nat this");
        assert_eq!(t[0].attachments.len(), 2);
        let first = &t[0].attachments[0];
        assert_eq!(first.content_type, "image/jpeg");
        assert!(first.name.starts_with("image_") && first.name.ends_with(".jpg"));
        let second = &t[0].attachments[1];
        assert_eq!(second.name, "cat.png");
        assert_eq!(second.content_type, "image/png");
    }

    #[test]
    fn empty_user_content_becomes_space() {
        let msgs = messages(serde_json::json!([
            {"role": "user", "content": ""},
            {"role": "user"},
            {"role": "assistant", "content": ""},
        ]));
        let t = build_templates(&msgs, &TemplateOptions::default());
        assert_eq!(t[0].content, " ");
        assert_eq!(t[1].content, " ");
        assert_eq!(t[2].content, "");
    }

    #[test]
    fn tavern_mode_merges_system_messages() {
        let msgs = messages(serde_json::json!([
            {"role": "user", "content": "q"},
            {"role": "system", "content": "one"},
            {"role": "developer", "content": "two"},
        ]));
        let options = TemplateOptions {
            tavern_mode: true,
            ..TemplateOptions::default()
        };
        let t = build_templates(&msgs, &options);
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].role, "system");
        assert_eq!(t[0].content, "one\n\ntwo");
        assert_eq!(t[1].content, "q");
    }

    #[test]
    fn bypass_appends_blank_user_at_position_a() {
        let msgs = messages(serde_json::json!([{"role": "user", "content": "q"}]));
        let options = TemplateOptions {
            bypass_sensitivity: true,
            battle_target: "B".into(),
            ..TemplateOptions::default()
        };
        let t = build_templates(&msgs, &options);
        let last = t.last().unwrap();
        assert_eq!(last.role, "user");
        assert_eq!(last.content, " ");
        assert_eq!(last.participant_position, "a");
    }

    #[test]
    fn serializes_with_camel_case_keys() {
        let t = MessageTemplate {
            role: "user".into(),
            content: "x".into(),
            attachments: vec![Attachment {
                name: "n".into(),
                content_type: "image/png".into(),
                url: "u".into(),
            }],
            participant_position: "a".into(),
        };
        let v = serde_json::to_value(&t).unwrap();
        assert_eq!(v["participantPosition"], "a");
        assert_eq!(v["attachments"][0]["contentType"], "image/png");
    }
}
