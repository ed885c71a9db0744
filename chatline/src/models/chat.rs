use serde::{Deserialize, Serialize};

/// Preview of the newest message shown in conversation lists.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LastMessage {
    pub text: String,
    pub timestamp: i64,
    pub sender_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Direct,
    Group,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessage>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ChatSummary {
    /// Whether this is the direct chat between exactly `participants`, in
    /// any order.
    pub fn is_direct_between(&self, participants: &[String]) -> bool {
        self.kind == ChatKind::Direct && participant_key(&self.participants) == participant_key(participants)
    }
}

/// Order-independent key for a participant list.
pub fn participant_key(participants: &[String]) -> String {
    let mut sorted: Vec<&str> = participants.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}

/// A chat as requested by a participant, before the backend assigns its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChat {
    pub kind: ChatKind,
    pub participants: Vec<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUpdate {
    pub last_message: LastMessage,
    pub updated_at: i64,
}
