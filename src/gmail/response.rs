use serde::{de, Deserialize, Deserializer};
use std::fmt;

use super::{HistoryId, Id, LabelId};

/// Gmail serializes 64-bit quantities (`historyId`, `internalDate`,
/// `startHistoryId`) as JSON strings. Accept both the string and the bare
/// number form.
fn u64_from_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct U64Visitor;

    impl<'de> de::Visitor<'de> for U64Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("an unsigned integer or its decimal string form")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom("negative integer"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            v.parse().map_err(E::custom)
        }
    }

    deserializer.deserialize_any(U64Visitor)
}

/// A label resource as returned by `users.labels.list`/`create`. System and
/// user labels share the shape; the distinction does not matter here.
#[derive(Deserialize, Debug, Clone)]
pub struct Label {
    pub id: LabelId,
    pub name: String,
}

#[derive(Deserialize, Debug)]
pub struct ListLabelsResponse {
    #[serde(default)]
    pub labels: Vec<Label>,
}

/// Bare message reference in a `users.messages.list` page.
#[derive(Deserialize, Debug)]
pub struct MessageRef {
    pub id: Id,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ListMessagesResponse {
    #[serde(default)]
    pub messages: Vec<MessageRef>,
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub result_size_estimate: u64,
}

/// `users.messages.get` with `format=minimal`, fields `id,historyId,labelIds`.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MinimalMessage {
    pub id: Id,
    #[serde(deserialize_with = "u64_from_string", default)]
    pub history_id: HistoryId,
    #[serde(default)]
    pub label_ids: Vec<LabelId>,
}

/// `users.messages.get` with `format=raw`, additionally carrying the
/// base64url-encoded RFC 822 payload and delivery metadata.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub id: Id,
    #[serde(deserialize_with = "u64_from_string", default)]
    pub history_id: HistoryId,
    #[serde(default)]
    pub label_ids: Vec<LabelId>,
    /// Milliseconds since the epoch, as assigned by Gmail on delivery.
    #[serde(deserialize_with = "u64_from_string", default)]
    pub internal_date: u64,
    pub raw: String,
    #[serde(default)]
    pub size_estimate: u64,
}

/// A message as embedded in history events: only the ID and label set are
/// ever populated.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    pub id: Id,
    #[serde(default)]
    pub label_ids: Vec<LabelId>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct HistoryMessageEntry {
    pub message: HistoryMessage,
}

/// One record of the `users.history.list` change log. Every event list may
/// be absent; an absent list is an empty one.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    #[serde(deserialize_with = "u64_from_string")]
    pub id: HistoryId,
    #[serde(default)]
    pub messages_added: Vec<HistoryMessageEntry>,
    #[serde(default)]
    pub messages_deleted: Vec<HistoryMessageEntry>,
    #[serde(default)]
    pub labels_added: Vec<HistoryMessageEntry>,
    #[serde(default)]
    pub labels_removed: Vec<HistoryMessageEntry>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ListHistoryResponse {
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    pub next_page_token: Option<String>,
}
