use serde::{Deserialize, Deserializer};
use snafu::prelude::*;
use std::{
    collections::{HashMap, HashSet},
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not read config file `{}': {}", filename.to_string_lossy(), source))]
    ReadConfigFile {
        filename: PathBuf,
        source: io::Error,
    },

    #[snafu(display("Could not parse config file `{}': {}", filename.to_string_lossy(), source))]
    ParseConfigFile {
        filename: PathBuf,
        source: toml::de::Error,
    },

    #[snafu(display("`index_batch_size' must be at least 1"))]
    IndexBatchSizeIsZero {},
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub core: Core,

    ignore_labels: IgnoreLabels,

    /// Gmail label → notmuch tag translation. Entries override or extend the
    /// default map of lowercased Gmail SYSTEM labels.
    #[serde(deserialize_with = "labels_translate_with_defaults")]
    pub labels_translate: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Core {
    /// Folder where mail files and the notmuch database live.
    ///
    /// When not set, the value is taken from the notmuch configuration
    /// (`NOTMUCH_CONFIG` or `~/.notmuch-config`), falling back to `~/mail`.
    pub notmuch_db: Option<PathBuf>,

    /// Folder for persistent notmuch-gmail data: OAuth2 credentials, the
    /// synchronization watermarks and the lock file. A relative path is
    /// resolved against the notmuch database folder.
    pub status_dir: PathBuf,

    /// Push local tag changes to Gmail. If false, local modifications are
    /// overwritten by remote changes regardless of `local_wins`.
    pub push_local_tags: bool,

    /// When the same message changed on both sides, favor the local tag set
    /// and replace the remote labels with it. By default the remote side
    /// wins.
    pub local_wins: bool,

    /// Upload purely local messages tagged "draft" as Gmail DRAFT messages.
    pub upload_drafts: bool,

    /// Upload purely local messages tagged "sent" as Gmail SENT messages
    /// (stores them, does not send them).
    pub upload_sent: bool,

    /// Socket timeout in seconds. 0 means the system default.
    pub http_timeout: u64,

    /// Number of newly fetched messages indexed per notmuch transaction.
    pub index_batch_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct IgnoreLabels {
    /// Whitespace-separated Gmail labels whose messages are not synchronized
    /// at all.
    no_sync: String,
    /// Whitespace-separated Gmail labels ignored on ingest (messages are
    /// synchronized without them).
    remote: String,
    /// Whitespace-separated notmuch tags ignored on read (never compared
    /// nor propagated).
    local: String,
}

impl Default for Core {
    fn default() -> Self {
        Self {
            notmuch_db: None,
            status_dir: PathBuf::from("./.notmuch-gmail"),
            push_local_tags: true,
            local_wins: false,
            upload_drafts: true,
            upload_sent: false,
            http_timeout: 5,
            index_batch_size: 200,
        }
    }
}

impl Default for IgnoreLabels {
    fn default() -> Self {
        Self {
            no_sync: "CHATS".to_string(),
            remote: "CATEGORY_FORUMS CATEGORY_PERSONAL CATEGORY_PROMOTIONS \
                     CATEGORY_SOCIAL CATEGORY_UPDATES"
                .to_string(),
            local: "attachment new signed".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: Core::default(),
            ignore_labels: IgnoreLabels::default(),
            labels_translate: default_labels_translate(),
        }
    }
}

fn default_labels_translate() -> HashMap<String, String> {
    [
        "INBOX", "SPAM", "TRASH", "UNREAD", "STARRED", "IMPORTANT", "SENT", "DRAFT",
    ]
    .into_iter()
    .map(|label| (label.to_string(), label.to_lowercase()))
    .collect()
}

fn labels_translate_with_defaults<'de, D>(
    deserializer: D,
) -> std::result::Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut map = default_labels_translate();
    map.extend(HashMap::<String, String>::deserialize(deserializer)?);
    Ok(map)
}

impl Config {
    /// Load the config file, or the built-in defaults when it does not
    /// exist.
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e).context(ReadConfigFileSnafu { filename: path }),
        };
        let config: Self =
            toml::from_str(&contents).context(ParseConfigFileSnafu { filename: path })?;
        ensure!(config.core.index_batch_size > 0, IndexBatchSizeIsZeroSnafu {});
        Ok(config)
    }

    /// The notmuch database folder, with the notmuch config and `~/mail`
    /// fallback chain applied.
    pub fn notmuch_db_dir(&self) -> PathBuf {
        if let Some(dir) = &self.core.notmuch_db {
            return expand_tilde(dir);
        }
        notmuch_config_db_path().unwrap_or_else(|| expand_tilde(Path::new("~/mail")))
    }

    /// The status folder, resolved against the notmuch database folder.
    pub fn status_dir(&self) -> PathBuf {
        let status_dir = expand_tilde(&self.core.status_dir);
        if status_dir.is_absolute() {
            status_dir
        } else {
            self.notmuch_db_dir().join(status_dir)
        }
    }

    pub fn http_timeout(&self) -> Option<Duration> {
        match self.core.http_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn no_sync_labels(&self) -> HashSet<String> {
        split_words(&self.ignore_labels.no_sync)
    }

    pub fn ignore_labels(&self) -> HashSet<String> {
        split_words(&self.ignore_labels.remote)
    }

    pub fn ignore_tags(&self) -> HashSet<String> {
        split_words(&self.ignore_labels.local)
    }

    /// The default configuration document printed by `defconfig`.
    pub const DEFAULT: &'static str = r#"# Default configuration for notmuch-gmail.
# Redirect to ~/.notmuch-gmail.toml and edit to taste.

[core]
# Folder where to store email messages in files and the notmuch database.
# By default, the value is extracted from your notmuch config file located
# at NOTMUCH_CONFIG (or at ~/.notmuch-config), falling back to ~/mail.
#notmuch_db = "~/mail"

# Folder where to store persistent data for notmuch-gmail such as Gmail
# OAuth2 credentials and synchronization watermarks. Any relative path is
# resolved against the notmuch_db path.
#status_dir = "./.notmuch-gmail"

# Push local tag changes to Gmail. If set to false, any local modification
# will be overwritten by remote changes (ignoring the local_wins option).
#push_local_tags = true

# In case of conflicting changes between local and remote (tags/labels
# changed on both sides on the same messages), favor the local version and
# replace the remote version with it. By default, the remote side wins.
#local_wins = false

# Upload local messages tagged as "draft" as Gmail DRAFT messages.
#upload_drafts = true

# Upload local messages tagged as "sent" as Gmail SENT messages (does not
# send the messages, only stores them in your Gmail account).
#upload_sent = false

# Socket timeout in seconds. 0 means use the system's default.
#http_timeout = 5

# Number of newly fetched messages indexed per notmuch transaction.
#index_batch_size = 200

[ignore_labels]
# Do not synchronize messages that have these Gmail labels.
#no_sync = "CHATS"

# Ignore the following Gmail labels (synchronize the messages without them).
#remote = "CATEGORY_FORUMS CATEGORY_PERSONAL CATEGORY_PROMOTIONS CATEGORY_SOCIAL CATEGORY_UPDATES"

# Ignore the following notmuch tags (synchronize the messages without them).
#local = "attachment new signed"

[labels_translate]
# Convert Gmail labels to notmuch tags (and vice versa). By default, only
# the reserved Gmail SYSTEM labels are converted to lower case, which is all
# you will ever need in general.
#INBOX = "inbox"
#SPAM = "spam"
#TRASH = "trash"
#UNREAD = "unread"
#STARRED = "starred"
#IMPORTANT = "important"
#SENT = "sent"
#DRAFT = "draft"
"#;
}

fn split_words(words: &str) -> HashSet<String> {
    words.split_whitespace().map(str::to_string).collect()
}

pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

/// Extract `[database] path` from a notmuch config document.
fn db_path_from_notmuch_config(contents: &str) -> Option<PathBuf> {
    let mut in_database = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_database = line == "[database]";
            continue;
        }
        if !in_database {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            if key.trim() == "path" {
                return Some(expand_tilde(Path::new(value.trim())));
            }
        }
    }
    None
}

fn notmuch_config_db_path() -> Option<PathBuf> {
    let path = env::var_os("NOTMUCH_CONFIG")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(".notmuch-config")))?;
    db_path_from_notmuch_config(&fs::read_to_string(path).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert!(config.core.push_local_tags);
        assert!(!config.core.local_wins);
        assert!(config.core.upload_drafts);
        assert!(!config.core.upload_sent);
        assert_eq!(config.core.http_timeout, 5);
        assert_eq!(config.core.index_batch_size, 200);
        assert!(config.no_sync_labels().contains("CHATS"));
        assert!(config.ignore_labels().contains("CATEGORY_PROMOTIONS"));
        assert!(config.ignore_tags().contains("new"));
        assert_eq!(config.labels_translate["TRASH"], "trash");
    }

    #[test]
    fn default_document_parses_back() {
        // The commented-out document must stay valid TOML.
        let config: Config = toml::from_str(Config::DEFAULT).unwrap();
        assert!(config.core.push_local_tags);
    }

    #[test]
    fn partial_file_keeps_unmentioned_defaults() {
        let config: Config = toml::from_str(
            r#"
            [core]
            local_wins = true
            http_timeout = 0

            [ignore_labels]
            no_sync = "CHATS FEEDBACK"
            "#,
        )
        .unwrap();
        assert!(config.core.local_wins);
        assert!(config.core.push_local_tags);
        assert_eq!(config.http_timeout(), None);
        assert_eq!(
            config.no_sync_labels(),
            HashSet::from(["CHATS".to_string(), "FEEDBACK".to_string()])
        );
        // Unmentioned sections keep their defaults too.
        assert!(config.ignore_tags().contains("signed"));
    }

    #[test]
    fn labels_translate_overrides_merge_with_defaults() {
        let config: Config = toml::from_str(
            r#"
            [labels_translate]
            TRASH = "deleted"
            "Work/Reports" = "reports"
            "#,
        )
        .unwrap();
        assert_eq!(config.labels_translate["TRASH"], "deleted");
        assert_eq!(config.labels_translate["Work/Reports"], "reports");
        assert_eq!(config.labels_translate["INBOX"], "inbox");
    }

    #[test]
    fn notmuch_config_database_path() {
        let contents = "\
[user]
name = Jane Doe

[database]
path = /srv/mail
";
        assert_eq!(
            db_path_from_notmuch_config(contents),
            Some(PathBuf::from("/srv/mail"))
        );
        assert_eq!(db_path_from_notmuch_config("[user]\nname = x\n"), None);
    }
}
