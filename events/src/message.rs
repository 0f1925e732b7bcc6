use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

pub type ConversationId = String;
pub type UserId = String;

/// Trait for getting the realtime event name used on the wire
pub trait EventType {
    fn event_type(&self) -> &'static str;
}

/// An id that the server sends either as a bare string or as an embedded
/// document (`{"_id": "..."}`).
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRef {
    Plain(String),
    Object {
        #[serde(alias = "_id", alias = "userId")]
        id: String,
    },
}

impl From<IdRef> for String {
    fn from(id: IdRef) -> Self {
        match id {
            IdRef::Plain(id) | IdRef::Object { id } => id,
        }
    }
}

fn id_ref<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    IdRef::deserialize(deserializer).map(String::from)
}

/// A chat message pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, alias = "_id", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(alias = "conversation", deserialize_with = "id_ref")]
    pub conversation_id: ConversationId,
    #[serde(alias = "sender", deserialize_with = "id_ref")]
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A message the current user sends into a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub conversation_id: ConversationId,
    pub content: String,
}

/// Events pushed by the realtime server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// `newMessage` / `message:new`
    NewMessage(ChatMessage),
    /// `user:online`
    PeerOnline(UserId),
    /// `user:offline`
    PeerOffline(UserId),
    /// `users:online`, the full presence list sent after (re)connecting
    PeerList(Vec<UserId>),
    /// Any event this client does not consume
    Unknown { name: String },
}

impl ServerEvent {
    /// Decodes a named event and its JSON payload.
    pub fn from_wire(name: &str, payload: Value) -> Result<Self, serde_json::Error> {
        let event = match name {
            "newMessage" | "message:new" => ServerEvent::NewMessage(decode_message(payload)?),
            "user:online" => ServerEvent::PeerOnline(decode_peer(payload)?),
            "user:offline" => ServerEvent::PeerOffline(decode_peer(payload)?),
            "users:online" => ServerEvent::PeerList(decode_peer_list(payload)?),
            other => ServerEvent::Unknown {
                name: other.to_string(),
            },
        };
        Ok(event)
    }
}

fn decode_message(payload: Value) -> Result<ChatMessage, serde_json::Error> {
    // Some handlers wrap the document as `{"message": {...}}`
    match payload {
        Value::Object(mut map) if matches!(map.get("message"), Some(Value::Object(_))) => {
            let inner = map.remove("message").unwrap_or(Value::Null);
            serde_json::from_value(inner)
        }
        other => serde_json::from_value(other),
    }
}

fn decode_peer(payload: Value) -> Result<UserId, serde_json::Error> {
    serde_json::from_value::<IdRef>(payload).map(String::from)
}

fn decode_peer_list(payload: Value) -> Result<Vec<UserId>, serde_json::Error> {
    let list = match payload {
        Value::Object(mut map) => map.remove("users").unwrap_or(Value::Array(vec![])),
        other => other,
    };
    let ids: Vec<IdRef> = serde_json::from_value(list)?;
    Ok(ids.into_iter().map(String::from).collect())
}

/// Events this client emits to the realtime server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JoinConversation(ConversationId),
    LeaveConversation(ConversationId),
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    SendMessage(OutgoingMessage),
}

impl ClientEvent {
    /// JSON payload sent alongside the event name.
    pub fn payload(&self) -> Value {
        match self {
            ClientEvent::JoinConversation(id) | ClientEvent::LeaveConversation(id) => json!(id),
            ClientEvent::Typing {
                conversation_id,
                is_typing,
            } => json!({
                "conversationId": conversation_id,
                "isTyping": is_typing,
            }),
            ClientEvent::SendMessage(message) => json!(message),
        }
    }
}

impl EventType for ClientEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ClientEvent::JoinConversation(_) => "joinConversation",
            ClientEvent::LeaveConversation(_) => "leaveConversation",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::SendMessage(_) => "sendMessage",
        }
    }
}
