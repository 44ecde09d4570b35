//! Typed inbound updates.
//!
//! Raw Bot API JSON is decoded exactly once here. Messages keep their original
//! JSON next to the typed view because the cache stores the snapshot verbatim.

use serde::Deserialize;
use serde_json::Value;

use crate::{
    domain::{ChatId, ConnectionId, MediaKind, MessageId, UserId},
    errors::Error,
    Result,
};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl User {
    pub fn user_id(&self) -> UserId {
        UserId(self.id)
    }

    /// `first last`, trimmed; `None` when both are missing.
    pub fn full_name(&self) -> Option<String> {
        let name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let name = name.trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }

    /// Label shown in notifications: `@username`, else the full name.
    pub fn label(&self) -> String {
        match (&self.username, self.full_name()) {
            (Some(u), _) if !u.is_empty() => format!("@{u}"),
            (_, Some(name)) => name,
            _ => "Пользователь".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl Chat {
    pub fn chat_id(&self) -> ChatId {
        ChatId(self.id)
    }

    pub fn is_private(&self) -> bool {
        self.kind.as_deref() == Some("private")
    }

    pub fn label(&self) -> String {
        if let Some(t) = self.title.as_deref().filter(|t| !t.is_empty()) {
            return t.to_string();
        }
        if self.is_private() {
            return "Личный чат".to_string();
        }
        format!("Чат {}", self.id)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct FileRef {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Poll {
    #[serde(default)]
    pub question: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SuccessfulPayment {
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub total_amount: Option<i64>,
    #[serde(default)]
    pub invoice_payload: String,
}

/// Downloadable attachment picked from a message, largest photo size first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub kind: MediaKind,
    pub file_id: String,
    pub file_unique_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Message {
    pub message_id: i32,
    #[serde(default)]
    pub from: Option<User>,
    pub chat: Chat,
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub edit_date: Option<i64>,
    #[serde(default)]
    pub business_connection_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Option<Vec<FileRef>>,
    #[serde(default)]
    pub video: Option<FileRef>,
    #[serde(default)]
    pub video_note: Option<FileRef>,
    #[serde(default)]
    pub document: Option<FileRef>,
    #[serde(default)]
    pub voice: Option<Value>,
    #[serde(default)]
    pub sticker: Option<Value>,
    #[serde(default)]
    pub animation: Option<Value>,
    #[serde(default)]
    pub audio: Option<Value>,
    #[serde(default)]
    pub contact: Option<Value>,
    #[serde(default)]
    pub location: Option<Value>,
    #[serde(default)]
    pub poll: Option<Poll>,
    #[serde(default)]
    pub successful_payment: Option<SuccessfulPayment>,
    #[serde(default)]
    pub reply_to_message: Option<Box<Message>>,

    /// Original JSON as delivered (plus local markers such as `_media_path`).
    #[serde(skip)]
    pub raw: Value,
}

impl Message {
    /// Decode a message and keep its JSON (and the nested reply's JSON).
    pub fn from_value(v: Value) -> Result<Self> {
        let mut msg: Message = serde_json::from_value(v.clone())
            .map_err(|e| Error::Decode(format!("message: {e}")))?;
        if let (Some(reply), Some(reply_raw)) =
            (msg.reply_to_message.as_mut(), v.get("reply_to_message"))
        {
            reply.raw = reply_raw.clone();
        }
        msg.raw = v;
        Ok(msg)
    }

    /// Decode a snapshot previously stored by the cache.
    pub fn from_snapshot(v: &Value) -> Option<Self> {
        Self::from_value(v.clone()).ok()
    }

    pub fn id(&self) -> MessageId {
        MessageId(self.message_id)
    }

    pub fn chat_id(&self) -> ChatId {
        self.chat.chat_id()
    }

    pub fn sender_id(&self) -> Option<UserId> {
        self.from.as_ref().map(User::user_id)
    }

    /// Business connection id, accepting the key spellings seen in the wild.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        extract_connection_id(&self.raw)
    }

    /// Outgoing business message: the account owner is speaking.
    pub fn is_outgoing_business(&self) -> bool {
        self.sender_id().map(|u| u.0) != Some(self.chat.id) && self.from.is_some()
    }

    pub fn attachment(&self) -> Option<Attachment> {
        let pick = |kind: MediaKind, f: &FileRef| Attachment {
            kind,
            file_id: f.file_id.clone(),
            file_unique_id: f
                .file_unique_id
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| f.file_id.clone()),
        };
        if let Some(largest) = self.photo.as_ref().and_then(|sizes| sizes.last()) {
            return Some(pick(MediaKind::Photo, largest));
        }
        if let Some(v) = &self.video {
            return Some(pick(MediaKind::Video, v));
        }
        if let Some(v) = &self.video_note {
            return Some(pick(MediaKind::VideoNote, v));
        }
        self.document.as_ref().map(|d| pick(MediaKind::Document, d))
    }

    /// Local path marker set once the vault stored this message's media.
    pub fn media_marker(&self) -> Option<&str> {
        self.raw.get("_media_path").and_then(Value::as_str)
    }

    pub fn set_media_marker(&mut self, kind: MediaKind, path: &str) {
        if let Some(obj) = self.raw.as_object_mut() {
            obj.insert("_media_kind".to_string(), Value::from(kind.as_str()));
            obj.insert("_media_path".to_string(), Value::from(path));
        }
    }

    /// Text used for edit/delete diffs, or a placeholder naming the content type.
    pub fn display_text(&self) -> String {
        if let Some(t) = self
            .text
            .as_deref()
            .or(self.caption.as_deref())
            .filter(|t| !t.is_empty())
        {
            return t.to_string();
        }
        if self.photo.is_some() {
            return "[photo]".to_string();
        }
        if self.video.is_some() {
            return "[video]".to_string();
        }
        if self.voice.is_some() {
            return "[voice message]".to_string();
        }
        if self.video_note.is_some() {
            return "[video note]".to_string();
        }
        if self.sticker.is_some() {
            return "[sticker]".to_string();
        }
        if self.animation.is_some() {
            return "[animation]".to_string();
        }
        if self.audio.is_some() {
            return "[audio]".to_string();
        }
        if self.contact.is_some() {
            return "[contact]".to_string();
        }
        if self.location.is_some() {
            return "[location]".to_string();
        }
        if let Some(p) = &self.poll {
            return match p.question.as_deref().filter(|q| !q.is_empty()) {
                Some(q) => format!("[poll] {q}"),
                None => "[poll]".to_string(),
            };
        }
        if let Some(d) = &self.document {
            return match d.file_name.as_deref().filter(|n| !n.is_empty()) {
                Some(n) => format!("[document] {n}"),
                None => "[document]".to_string(),
            };
        }
        "[content]".to_string()
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PreCheckoutQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub total_amount: Option<i64>,
    #[serde(default)]
    pub invoice_payload: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BusinessConnection {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub is_enabled: Option<bool>,
    #[serde(skip)]
    pub raw: Value,
}

impl BusinessConnection {
    /// The update's own `id`, else any of the generic spellings.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.id
            .clone()
            .filter(|id| !id.is_empty())
            .map(ConnectionId)
            .or_else(|| extract_connection_id(&self.raw))
    }

    pub fn owner(&self) -> Option<UserId> {
        self.user
            .as_ref()
            .map(User::user_id)
            .or(self.user_id.map(UserId))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeletedBusinessMessages {
    pub chat: Chat,
    #[serde(default)]
    pub message_ids: Vec<i32>,
    #[serde(skip)]
    pub raw: Value,
}

impl DeletedBusinessMessages {
    pub fn connection_id(&self) -> Option<ConnectionId> {
        extract_connection_id(&self.raw)
    }
}

/// One inbound event; exactly one variant is active.
#[derive(Clone, Debug)]
pub enum UpdateKind {
    PreCheckoutQuery(PreCheckoutQuery),
    SuccessfulPayment(Message),
    BusinessConnection(BusinessConnection),
    CallbackQuery(CallbackQuery),
    Message(Message),
    BusinessMessage(Message),
    EditedBusinessMessage(Message),
    DeletedBusinessMessages(DeletedBusinessMessages),
    EditedMessage(Message),
}

impl UpdateKind {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateKind::PreCheckoutQuery(_) => "pre_checkout_query",
            UpdateKind::SuccessfulPayment(_) => "successful_payment",
            UpdateKind::BusinessConnection(_) => "business_connection",
            UpdateKind::CallbackQuery(_) => "callback_query",
            UpdateKind::Message(_) => "message",
            UpdateKind::BusinessMessage(_) => "business_message",
            UpdateKind::EditedBusinessMessage(_) => "edited_business_message",
            UpdateKind::DeletedBusinessMessages(_) => "deleted_business_messages",
            UpdateKind::EditedMessage(_) => "edited_message",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Update {
    pub update_id: i64,
    /// `None` for update kinds the monitor does not handle.
    pub kind: Option<UpdateKind>,
}

impl Update {
    /// Classify a raw update. First matching key wins.
    pub fn decode(v: Value) -> Result<Self> {
        let update_id = v
            .get("update_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::Decode("update without update_id".to_string()))?;
        let Value::Object(mut obj) = v else {
            return Err(Error::Decode("update is not an object".to_string()));
        };

        let kind = if let Some(q) = obj.remove("pre_checkout_query") {
            Some(UpdateKind::PreCheckoutQuery(decode_as(q, "pre_checkout_query")?))
        } else if let Some(m) = obj.remove("message") {
            let msg = Message::from_value(m)?;
            if msg.successful_payment.is_some() {
                Some(UpdateKind::SuccessfulPayment(msg))
            } else {
                classify_rest(obj, Some(msg))?
            }
        } else {
            classify_rest(obj, None)?
        };

        Ok(Self { update_id, kind })
    }
}

fn classify_rest(
    mut obj: serde_json::Map<String, Value>,
    message: Option<Message>,
) -> Result<Option<UpdateKind>> {
    if let Some(bc) = obj.remove("business_connection") {
        let mut conn: BusinessConnection = decode_as(bc.clone(), "business_connection")?;
        conn.raw = bc;
        return Ok(Some(UpdateKind::BusinessConnection(conn)));
    }
    if let Some(cq) = obj.remove("callback_query") {
        return Ok(Some(UpdateKind::CallbackQuery(decode_as(
            cq,
            "callback_query",
        )?)));
    }
    if let Some(m) = message {
        return Ok(Some(UpdateKind::Message(m)));
    }
    if let Some(m) = obj.remove("business_message") {
        return Ok(Some(UpdateKind::BusinessMessage(Message::from_value(m)?)));
    }
    if let Some(m) = obj.remove("edited_business_message") {
        return Ok(Some(UpdateKind::EditedBusinessMessage(Message::from_value(
            m,
        )?)));
    }
    if let Some(d) = obj.remove("deleted_business_messages") {
        let mut del: DeletedBusinessMessages = decode_as(d.clone(), "deleted_business_messages")?;
        del.raw = d;
        return Ok(Some(UpdateKind::DeletedBusinessMessages(del)));
    }
    if let Some(m) = obj.remove("edited_message") {
        return Ok(Some(UpdateKind::EditedMessage(Message::from_value(m)?)));
    }
    Ok(None)
}

fn decode_as<T: serde::de::DeserializeOwned>(v: Value, what: &str) -> Result<T> {
    serde_json::from_value(v).map_err(|e| Error::Decode(format!("{what}: {e}")))
}

const TOP_LEVEL_CONNECTION_KEYS: [&str; 4] = [
    "business_connection_id",
    "business_connectionId",
    "connection_id",
    "connectionId",
];
const NESTED_CONNECTION_KEYS: [&str; 3] = ["id", "business_connection_id", "connection_id"];

/// Find a business connection id in any payload.
///
/// Checks the known top-level spellings first, then a nested
/// `business_connection` object.
pub fn extract_connection_id(v: &Value) -> Option<ConnectionId> {
    for key in TOP_LEVEL_CONNECTION_KEYS {
        if let Some(id) = v.get(key).and_then(stringify_id) {
            return Some(ConnectionId(id));
        }
    }
    if let Some(nested) = v.get("business_connection").filter(|n| n.is_object()) {
        for key in NESTED_CONNECTION_KEYS {
            if let Some(id) = nested.get(key).and_then(stringify_id) {
                return Some(ConnectionId(id));
            }
        }
    }
    None
}

fn stringify_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn business_message(cid: &str, from: i64, chat: i64, text: &str) -> Value {
        json!({
            "update_id": 10,
            "business_message": {
                "message_id": 5,
                "business_connection_id": cid,
                "from": {"id": from, "is_bot": false, "first_name": "A"},
                "chat": {"id": chat, "type": "private"},
                "date": 1,
                "text": text
            }
        })
    }

    #[test]
    fn classifies_business_message_and_keeps_raw() {
        let upd = Update::decode(business_message("c1", 1, 2, "hi")).unwrap();
        let Some(UpdateKind::BusinessMessage(m)) = upd.kind else {
            panic!("expected business message");
        };
        assert_eq!(m.connection_id(), Some(ConnectionId("c1".to_string())));
        assert_eq!(m.raw["text"], "hi");
        assert!(m.is_outgoing_business());
    }

    #[test]
    fn business_connection_uses_its_own_id() {
        let upd = Update::decode(json!({
            "update_id": 4,
            "business_connection": {"id": "bc-1", "user": {"id": 5, "is_bot": false}, "is_enabled": true}
        }))
        .unwrap();
        let Some(UpdateKind::BusinessConnection(bc)) = upd.kind else {
            panic!("expected business connection");
        };
        assert_eq!(bc.connection_id(), Some(ConnectionId("bc-1".to_string())));
        assert_eq!(bc.owner(), Some(UserId(5)));
    }

    #[test]
    fn successful_payment_wins_over_plain_message() {
        let upd = Update::decode(json!({
            "update_id": 1,
            "message": {
                "message_id": 1,
                "chat": {"id": 9, "type": "private"},
                "successful_payment": {"currency": "XTR", "total_amount": 15, "invoice_payload": "sub:7d:9"}
            }
        }))
        .unwrap();
        assert!(matches!(upd.kind, Some(UpdateKind::SuccessfulPayment(_))));
    }

    #[test]
    fn unknown_update_kinds_decode_to_none() {
        let upd = Update::decode(json!({"update_id": 3, "poll_answer": {}})).unwrap();
        assert!(upd.kind.is_none());
        assert!(Update::decode(json!({"message": {}})).is_err());
    }

    #[test]
    fn extracts_connection_id_from_known_spellings() {
        assert_eq!(
            extract_connection_id(&json!({"connectionId": 77})),
            Some(ConnectionId("77".to_string()))
        );
        assert_eq!(
            extract_connection_id(&json!({"business_connection": {"connection_id": "n"}})),
            Some(ConnectionId("n".to_string()))
        );
        assert_eq!(extract_connection_id(&json!({"id": "x"})), None);
        assert_eq!(extract_connection_id(&json!({"business_connection_id": ""})), None);
    }

    #[test]
    fn picks_largest_photo_and_falls_back_to_file_id() {
        let m = Message::from_value(json!({
            "message_id": 1,
            "chat": {"id": 1},
            "photo": [
                {"file_id": "small", "file_unique_id": "s"},
                {"file_id": "big"}
            ]
        }))
        .unwrap();
        let a = m.attachment().unwrap();
        assert_eq!(a.kind, MediaKind::Photo);
        assert_eq!(a.file_id, "big");
        assert_eq!(a.file_unique_id, "big");
        assert_eq!(m.display_text(), "[photo]");
    }

    #[test]
    fn display_text_prefers_text_then_caption_then_placeholder() {
        let doc = Message::from_value(json!({
            "message_id": 1, "chat": {"id": 1},
            "document": {"file_id": "d", "file_name": "a.pdf"}
        }))
        .unwrap();
        assert_eq!(doc.display_text(), "[document] a.pdf");

        let cap = Message::from_value(json!({
            "message_id": 1, "chat": {"id": 1}, "caption": "look", "video": {"file_id": "v"}
        }))
        .unwrap();
        assert_eq!(cap.display_text(), "look");

        let poll = Message::from_value(json!({
            "message_id": 1, "chat": {"id": 1}, "poll": {"question": "q?"}
        }))
        .unwrap();
        assert_eq!(poll.display_text(), "[poll] q?");
    }

    #[test]
    fn reply_keeps_its_own_raw_json() {
        let m = Message::from_value(json!({
            "message_id": 2, "chat": {"id": 1}, "text": "re",
            "reply_to_message": {"message_id": 1, "chat": {"id": 1}, "video_note": {"file_id": "vn"}}
        }))
        .unwrap();
        let r = m.reply_to_message.as_ref().unwrap();
        assert_eq!(r.raw["message_id"], 1);
        assert_eq!(r.attachment().unwrap().kind, MediaKind::VideoNote);
    }

    #[test]
    fn user_label_prefers_username() {
        let u = User {
            id: 1,
            first_name: Some("Ann".into()),
            last_name: Some("Lee".into()),
            ..Default::default()
        };
        assert_eq!(u.label(), "Ann Lee");
        let u = User {
            username: Some("ann".into()),
            ..u
        };
        assert_eq!(u.label(), "@ann");
        assert_eq!(User::default().label(), "Пользователь");
    }
}
