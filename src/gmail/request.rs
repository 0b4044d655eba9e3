use super::LabelId;
use serde::Serialize;

/// Body of `users.messages.modify`.
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelPatch {
    /// A list of IDs of labels to add to this message. You can add up to 100 labels with each
    /// update.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_label_ids: Vec<LabelId>,
    /// A list IDs of labels to remove from this message. You can remove up to 100 labels with
    /// each update.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub remove_label_ids: Vec<LabelId>,
}

impl LabelPatch {
    pub fn is_empty(&self) -> bool {
        self.add_label_ids.is_empty() && self.remove_label_ids.is_empty()
    }
}

/// Body of `users.labels.create`. Only the name is mandatory; visibility fields keep their
/// server-side defaults.
#[derive(Serialize, Debug)]
pub struct LabelCreate<'a> {
    pub name: &'a str,
}

/// Metadata half of a `users.messages.insert` multipart upload.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct MessageInsert {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub label_ids: Vec<LabelId>,
}
