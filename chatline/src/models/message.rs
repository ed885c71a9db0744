use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

impl Attachment {
    pub fn image(url: &str, timestamp: i64) -> Self {
        Self {
            url: url.to_string(),
            kind: "image".to_string(),
            name: format!("image_{}", timestamp),
            size: 0,
        }
    }
}

/// One child entry of a conversation as the backend delivers it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub key: String,
    pub value: Value,
}

impl RawRecord {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    /// Creation time in milliseconds; the ordering key.
    pub timestamp: i64,
    pub read: bool,
    pub edited: bool,
    pub attachments: Vec<Attachment>,
}

impl Message {
    /// Parse a backend record. Records without a sender or a positive
    /// timestamp are malformed and yield `None`.
    pub fn from_record(conversation_id: &str, record: &RawRecord) -> Option<Self> {
        let data = record.value.as_object()?;

        let sender_id = data
            .get("senderId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())?;
        let timestamp = data
            .get("timestamp")
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .filter(|ts| *ts > 0)?;

        let conversation_id = data
            .get("chatId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(conversation_id);

        // `isEdited` is an older spelling of `edited`
        let edited = flag(data, "edited") || flag(data, "isEdited");

        let attachments = data
            .get("attachments")
            .cloned()
            .and_then(|v| serde_json::from_value::<Vec<Attachment>>(v).ok())
            .unwrap_or_default();

        Some(Self {
            id: record.key.clone(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            text: data
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            timestamp,
            read: flag(data, "read"),
            edited,
            attachments,
        })
    }

    /// Wire representation written to the backend.
    pub fn to_record(&self) -> RawRecord {
        let mut value = json!({
            "id": self.id,
            "chatId": self.conversation_id,
            "senderId": self.sender_id,
            "text": self.text,
            "timestamp": self.timestamp,
            "read": self.read,
            "edited": self.edited,
        });
        if !self.attachments.is_empty() {
            value["attachments"] = json!(self.attachments);
        }
        RawRecord::new(self.id.clone(), value)
    }

    /// Order within a conversation: timestamp first, backend id for ties.
    pub fn order_cmp(&self, other: &Message) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }

    pub fn precedes(&self, other: &Message) -> bool {
        self.order_cmp(other) == Ordering::Less
    }
}

fn flag(data: &Map<String, Value>, field: &str) -> bool {
    match data.get(field) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Null) | None => false,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

/// A message as composed by a participant, before the backend assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: String,
    pub text: String,
    pub timestamp: i64,
    pub attachments: Vec<Attachment>,
}

/// Partial update applied to a stored message. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessagePatch {
    pub text: Option<String>,
    pub edited: Option<bool>,
    pub read: Option<bool>,
}

impl MessagePatch {
    pub fn edit(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            edited: Some(true),
            read: None,
        }
    }

    pub fn mark_read() -> Self {
        Self {
            read: Some(true),
            ..Self::default()
        }
    }

    pub fn apply(&self, value: &mut Value) {
        let Some(data) = value.as_object_mut() else {
            return;
        };
        if let Some(text) = &self.text {
            data.insert("text".to_string(), json!(text));
        }
        if let Some(edited) = self.edited {
            data.insert("edited".to_string(), json!(edited));
        }
        if let Some(read) = self.read {
            data.insert("read".to_string(), json!(read));
        }
    }
}
