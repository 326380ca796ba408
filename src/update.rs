use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single update received from the Bot API.
///
/// `update_id` is assigned by Telegram and strictly increases; it is used for
/// both the long-poll offset and the dispatch order of queued records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub kind: UpdateKind,
}

/// The closed set of update kinds the pipeline delivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum UpdateKind {
    DirectMessage(Message),
    GroupMessage(Message),
    EditedMessage(Message),
    ChannelPost(Message),
    EditedChannelPost(Message),
    InlineQuery(InlineQuery),
    CallbackQuery(CallbackQuery),
    ChosenInlineResult(ChosenInlineResult),
}

impl UpdateKind {
    /// Stable name, also stored in the `kind` column of the queue table.
    pub fn name(&self) -> &'static str {
        match self {
            UpdateKind::DirectMessage(_) => "direct_message",
            UpdateKind::GroupMessage(_) => "group_message",
            UpdateKind::EditedMessage(_) => "edited_message",
            UpdateKind::ChannelPost(_) => "channel_post",
            UpdateKind::EditedChannelPost(_) => "edited_channel_post",
            UpdateKind::InlineQuery(_) => "inline_query",
            UpdateKind::CallbackQuery(_) => "callback_query",
            UpdateKind::ChosenInlineResult(_) => "chosen_inline_result",
        }
    }
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub date: i64,
    pub chat: Chat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineQuery {
    pub id: String,
    pub from: User,
    pub query: String,
    #[serde(default)]
    pub offset: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChosenInlineResult {
    pub result_id: String,
    pub from: User,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_message_id: Option<String>,
}

/// One element of a `getUpdates` result after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    Supported(Update),
    /// Carries a valid `update_id` but no kind this pipeline delivers
    /// (polls, chat member changes, ...).
    Unsupported { update_id: i64, reason: String },
    /// A kind we deliver whose payload failed to parse. The event is lost
    /// once acknowledged, so it is reported louder than `Unsupported`.
    Malformed { update_id: i64, reason: String },
}

impl Fetched {
    pub fn update_id(&self) -> i64 {
        match self {
            Fetched::Supported(update) => update.update_id,
            Fetched::Unsupported { update_id, .. } | Fetched::Malformed { update_id, .. } => {
                *update_id
            }
        }
    }
}

#[derive(Deserialize)]
struct RawUpdate {
    message: Option<Message>,
    edited_message: Option<Message>,
    channel_post: Option<Message>,
    edited_channel_post: Option<Message>,
    inline_query: Option<InlineQuery>,
    callback_query: Option<CallbackQuery>,
    chosen_inline_result: Option<ChosenInlineResult>,
}

/// Classify one raw Bot API update object.
///
/// Returns `None` only when the element has no integer `update_id`; such a
/// response cannot be acknowledged safely and is rejected as a whole.
pub fn classify(raw: &Value) -> Option<Fetched> {
    let update_id = raw.get("update_id")?.as_i64()?;

    let parsed: RawUpdate = match serde_json::from_value(raw.clone()) {
        Ok(parsed) => parsed,
        Err(e) => {
            return Some(Fetched::Malformed {
                update_id,
                reason: format!("unparseable payload: {}", e),
            })
        }
    };

    let kind = if let Some(msg) = parsed.message {
        if msg.chat.kind == ChatKind::Private {
            UpdateKind::DirectMessage(msg)
        } else {
            UpdateKind::GroupMessage(msg)
        }
    } else if let Some(msg) = parsed.edited_message {
        UpdateKind::EditedMessage(msg)
    } else if let Some(msg) = parsed.channel_post {
        UpdateKind::ChannelPost(msg)
    } else if let Some(msg) = parsed.edited_channel_post {
        UpdateKind::EditedChannelPost(msg)
    } else if let Some(query) = parsed.inline_query {
        UpdateKind::InlineQuery(query)
    } else if let Some(query) = parsed.callback_query {
        UpdateKind::CallbackQuery(query)
    } else if let Some(result) = parsed.chosen_inline_result {
        UpdateKind::ChosenInlineResult(result)
    } else {
        let fields: Vec<&str> = raw
            .as_object()
            .map(|obj| {
                obj.keys()
                    .map(String::as_str)
                    .filter(|k| *k != "update_id")
                    .collect()
            })
            .unwrap_or_default();
        return Some(Fetched::Unsupported {
            update_id,
            reason: format!("unsupported update kind: {}", fields.join(",")),
        });
    };

    Some(Fetched::Supported(Update { update_id, kind }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn text_message(update_id: i64, text: &str) -> Update {
        Update {
            update_id,
            kind: UpdateKind::DirectMessage(Message {
                message_id: update_id * 10,
                date: 1_700_000_000,
                chat: Chat {
                    id: 42,
                    kind: ChatKind::Private,
                    title: None,
                    username: Some("alice".to_string()),
                },
                from: Some(User {
                    id: 42,
                    is_bot: false,
                    first_name: "Alice".to_string(),
                    username: Some("alice".to_string()),
                }),
                text: Some(text.to_string()),
                caption: None,
            }),
        }
    }

    fn message_json(chat_type: &str) -> Value {
        json!({
            "message_id": 7,
            "date": 1700000000,
            "chat": { "id": -100, "type": chat_type, "title": "dev" },
            "from": { "id": 1, "is_bot": false, "first_name": "Bob" },
            "text": "hi"
        })
    }

    #[test]
    fn test_private_message_is_direct() {
        let raw = json!({ "update_id": 10, "message": message_json("private") });
        match classify(&raw).unwrap() {
            Fetched::Supported(update) => {
                assert_eq!(update.update_id, 10);
                assert_eq!(update.kind.name(), "direct_message");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_supergroup_message_is_group() {
        let raw = json!({ "update_id": 11, "message": message_json("supergroup") });
        let fetched = classify(&raw).unwrap();
        assert!(matches!(
            fetched,
            Fetched::Supported(Update { kind: UpdateKind::GroupMessage(_), .. })
        ));
    }

    #[test]
    fn test_each_kind_classified() {
        let from = json!({ "id": 1, "first_name": "Bob" });
        let cases = vec![
            (json!({ "update_id": 1, "edited_message": message_json("private") }), "edited_message"),
            (json!({ "update_id": 2, "channel_post": message_json("channel") }), "channel_post"),
            (
                json!({ "update_id": 3, "edited_channel_post": message_json("channel") }),
                "edited_channel_post",
            ),
            (
                json!({ "update_id": 4, "inline_query": { "id": "q", "from": from, "query": "cats", "offset": "" } }),
                "inline_query",
            ),
            (
                json!({ "update_id": 5, "callback_query": { "id": "c", "from": from, "data": "yes", "chat_instance": "x" } }),
                "callback_query",
            ),
            (
                json!({ "update_id": 6, "chosen_inline_result": { "result_id": "r", "from": from, "query": "cats" } }),
                "chosen_inline_result",
            ),
        ];

        for (raw, expected) in cases {
            match classify(&raw).unwrap() {
                Fetched::Supported(update) => assert_eq!(update.kind.name(), expected),
                other => panic!("{} classified as {:?}", expected, other),
            }
        }
    }

    #[test]
    fn test_unknown_kind_is_unsupported() {
        let raw = json!({ "update_id": 12, "poll": { "id": "p" } });
        let fetched = classify(&raw).unwrap();
        assert_eq!(fetched.update_id(), 12);
        match fetched {
            Fetched::Unsupported { reason, .. } => assert!(reason.contains("poll")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_broken_payload_is_malformed() {
        let raw = json!({ "update_id": 13, "message": { "text": "no chat" } });
        assert!(matches!(
            classify(&raw),
            Some(Fetched::Malformed { update_id: 13, .. })
        ));

        let mut raw = json!({ "update_id": 5, "message": message_json("private") });
        raw["message"]["date"] = json!("yesterday");
        match classify(&raw) {
            Some(Fetched::Malformed { update_id, reason }) => {
                assert_eq!(update_id, 5);
                assert!(reason.contains("unparseable payload"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_missing_update_id_rejected() {
        assert!(classify(&json!({ "message": message_json("private") })).is_none());
        assert!(classify(&json!({ "update_id": "10" })).is_none());
    }

    #[test]
    fn test_stored_form_is_tagged() {
        let update = text_message(3, "hello");
        let stored = serde_json::to_value(&update.kind).unwrap();
        assert_eq!(stored["kind"], "direct_message");
        assert_eq!(stored["payload"]["chat"]["type"], "private");

        let back: UpdateKind = serde_json::from_value(stored).unwrap();
        assert_eq!(back, update.kind);
    }
}
