use crate::config::Config;
use crate::gmail;
use log::debug;
use snafu::prelude::*;
use std::collections::{HashMap, HashSet};

/// A message carries a label from the no-sync list and must be treated as
/// nonexistent by the engine.
#[derive(Debug, Snafu)]
#[snafu(display("Message bears a no-sync label"))]
pub struct NoSync;

/// Bidirectional label↔tag translation plus the ignore/no-sync filter rules.
///
/// The name/ID mirrors are refreshed from the server's label catalog; the
/// translation tables are process-lifetime state built from the config.
/// Labels without a translation entry map to themselves, as do tags without
/// an inverse.
pub struct LabelMap {
    names_by_id: HashMap<gmail::LabelId, String>,
    ids_by_name: HashMap<String, gmail::LabelId>,
    label_to_tag: HashMap<String, String>,
    tag_to_label: HashMap<String, String>,
    no_sync_labels: HashSet<String>,
    ignore_labels: HashSet<String>,
    ignore_tags: HashSet<String>,
}

impl LabelMap {
    pub fn new(config: &Config) -> Self {
        let label_to_tag = config.labels_translate.clone();
        let tag_to_label = label_to_tag
            .iter()
            .map(|(label, tag)| (tag.clone(), label.clone()))
            .collect();
        Self {
            names_by_id: HashMap::new(),
            ids_by_name: HashMap::new(),
            label_to_tag,
            tag_to_label,
            no_sync_labels: config.no_sync_labels(),
            ignore_labels: config.ignore_labels(),
            ignore_tags: config.ignore_tags(),
        }
    }

    /// Replace the name/ID mirrors with a fresh label catalog.
    pub fn update_catalog(&mut self, labels: impl IntoIterator<Item = gmail::Label>) {
        self.names_by_id.clear();
        self.ids_by_name.clear();
        for label in labels {
            self.insert(label);
        }
    }

    /// Insert a single label into both mirrors, e.g. after creating it on
    /// the server.
    pub fn insert(&mut self, label: gmail::Label) {
        self.ids_by_name.insert(label.name.clone(), label.id.clone());
        self.names_by_id.insert(label.id, label.name);
    }

    /// The catalog name for a label ID. System label IDs are their own name;
    /// an ID missing from the catalog is used verbatim.
    pub fn label_name<'a>(&'a self, id: &'a gmail::LabelId) -> &'a str {
        match self.names_by_id.get(id) {
            Some(name) => name.as_str(),
            None => {
                debug!("label id `{}' not in catalog, using it as a name", id);
                id.0.as_str()
            }
        }
    }

    pub fn label_id(&self, name: &str) -> Option<&gmail::LabelId> {
        self.ids_by_name.get(name)
    }

    /// Translate one label name to its local tag. `None` means the label is
    /// filtered (remote-ignored, or its tag is local-ignored).
    pub fn tag_for_label<'a>(&'a self, name: &'a str) -> Result<Option<&'a str>, NoSync> {
        ensure!(!self.no_sync_labels.contains(name), NoSyncSnafu);
        if self.ignore_labels.contains(name) {
            return Ok(None);
        }
        let tag = self
            .label_to_tag
            .get(name)
            .map(String::as_str)
            .unwrap_or(name);
        if self.ignore_tags.contains(tag) {
            return Ok(None);
        }
        Ok(Some(tag))
    }

    /// Translate one local tag back to its label name.
    pub fn label_for_tag<'a>(&'a self, tag: &'a str) -> &'a str {
        self.tag_to_label.get(tag).map(String::as_str).unwrap_or(tag)
    }

    /// The tag set of a remote message, derived from its label IDs with the
    /// full filter chain applied. Fails with `NoSync` when any label is in
    /// the no-sync list; callers drop such messages from the change stream.
    pub fn message_tags(&self, label_ids: &[gmail::LabelId]) -> Result<HashSet<String>, NoSync> {
        let mut tags = HashSet::new();
        for id in label_ids {
            let name = self.label_name(id);
            if let Some(tag) = self.tag_for_label(name)? {
                tags.insert(tag.to_string());
            }
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn label_ids(names: &[&str]) -> Vec<gmail::LabelId> {
        names.iter().map(|n| gmail::LabelId(n.to_string())).collect()
    }

    fn default_map() -> LabelMap {
        LabelMap::new(&Config::default())
    }

    #[test]
    fn system_labels_round_trip() {
        let map = default_map();
        for label in [
            "INBOX",
            "SPAM",
            "TRASH",
            "UNREAD",
            "STARRED",
            "IMPORTANT",
            "SENT",
            "DRAFT",
        ] {
            let tag = map.tag_for_label(label).unwrap().unwrap();
            assert_eq!(tag, label.to_lowercase());
            assert_eq!(map.label_for_tag(tag), label);
        }
    }

    #[test]
    fn unmapped_names_pass_through_both_ways() {
        let map = default_map();
        assert_eq!(map.tag_for_label("receipts").unwrap(), Some("receipts"));
        assert_eq!(map.label_for_tag("receipts"), "receipts");
    }

    #[test]
    fn remote_ignored_labels_are_filtered() {
        let map = default_map();
        let tags = map
            .message_tags(&label_ids(&["SENT", "CATEGORY_PROMOTIONS"]))
            .unwrap();
        assert_eq!(tags, HashSet::from(["sent".to_string()]));
    }

    #[test]
    fn local_ignored_tags_are_filtered() {
        let map = default_map();
        // `new` is in the default local ignore list; a label translating to
        // it must never surface.
        let tags = map.message_tags(&label_ids(&["new", "INBOX"])).unwrap();
        assert_eq!(tags, HashSet::from(["inbox".to_string()]));
    }

    #[test]
    fn no_sync_label_rejects_the_whole_message() {
        let map = default_map();
        assert!(map.message_tags(&label_ids(&["INBOX", "CHATS"])).is_err());
    }

    #[test]
    fn catalog_resolves_user_label_ids() {
        let mut map = default_map();
        map.update_catalog(vec![gmail::Label {
            id: gmail::LabelId("Label_7".to_string()),
            name: "receipts".to_string(),
        }]);
        let tags = map.message_tags(&label_ids(&["Label_7"])).unwrap();
        assert_eq!(tags, HashSet::from(["receipts".to_string()]));
        assert_eq!(map.label_id("receipts").unwrap().0, "Label_7");
    }

    #[test]
    fn config_override_extends_the_bijection() {
        let config: Config = toml::from_str(
            r#"
            [labels_translate]
            "My Stuff" = "stuff"
            "#,
        )
        .unwrap();
        let map = LabelMap::new(&config);
        assert_eq!(map.tag_for_label("My Stuff").unwrap(), Some("stuff"));
        assert_eq!(map.label_for_tag("stuff"), "My Stuff");
        // Defaults survive alongside overrides.
        assert_eq!(map.tag_for_label("INBOX").unwrap(), Some("inbox"));
    }
}
