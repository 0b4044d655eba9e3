use crate::config::Config;
use crate::gmail;
use const_format::formatcp;
use lazy_static::lazy_static;
use log::{debug, warn};
use notmuch::{Database, DatabaseMode};
use regex::Regex;
use snafu::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const ID_PATTERN: &str = r"[0-9a-f]+";
// Standard Maildir flags are accepted on read; we only ever write the bare
// `:2,` suffix ourselves.
const MAIL_PATTERN: &str = formatcp!(r"^gmail\.({}):2,[DFPRST]*$", ID_PATTERN);

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not open notmuch database: {}", source))]
    OpenDatabase { source: notmuch::Error },

    #[snafu(display("Could not create notmuch database at `{}': {}", path.to_string_lossy(), source))]
    CreateDatabase {
        path: PathBuf,
        source: notmuch::Error,
    },

    #[snafu(display("Could not create maildir dir `{}': {}", path.to_string_lossy(), source))]
    CreateMaildirDir { path: PathBuf, source: io::Error },

    #[snafu(display("Could not create notmuch query `{}': {}", query, source))]
    CreateNotmuchQuery {
        query: String,
        source: notmuch::Error,
    },

    #[snafu(display("Could not execute notmuch query `{}': {}", query, source))]
    ExecuteNotmuchQuery {
        query: String,
        source: notmuch::Error,
    },

    #[snafu(display("Could not write mail file `{}': {}", path.to_string_lossy(), source))]
    WriteMailFile { path: PathBuf, source: io::Error },

    #[snafu(display("Could not rename mail file from `{}' to `{}': {}", from.to_string_lossy(), to.to_string_lossy(), source))]
    RenameMailFile {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[snafu(display("Could not index file in notmuch database: {}", source))]
    IndexFile { source: notmuch::Error },

    #[snafu(display("Could not look up message by filename: {}", source))]
    FindMessage { source: notmuch::Error },

    #[snafu(display("Could not update message tags: {}", source))]
    UpdateTags { source: notmuch::Error },

    #[snafu(display("Could not remove mail file `{}': {}", path.to_string_lossy(), source))]
    RemoveMailFile { path: PathBuf, source: io::Error },

    #[snafu(display("Could not begin atomic database operation: {}", source))]
    BeginAtomic { source: notmuch::Error },

    #[snafu(display("Could not end atomic database operation: {}", source))]
    EndAtomic { source: notmuch::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub type TagSet = HashSet<String>;

/// The local side: a dedicated `gmail` maildir under the notmuch root plus
/// the notmuch tag index.
pub struct Local {
    db: Database,
    mail_tmp_dir: PathBuf,
    mail_new_dir: PathBuf,
    /// Tags never observed nor written (subtracted from every tag set read
    /// back from notmuch).
    ignore_tags: TagSet,
}

impl Local {
    /// Open (or create) the notmuch database and ensure the gmail maildir
    /// exists.
    pub fn open(config: &Config) -> Result<Self> {
        let root = config.notmuch_db_dir();
        let db = if root.join(".notmuch").is_dir() {
            Database::open_with_config::<&Path, &Path>(
                Some(root.as_path()),
                DatabaseMode::ReadWrite,
                None,
                None,
            )
            .context(OpenDatabaseSnafu {})?
        } else {
            crate::state::create_private_dir(&root)
                .context(CreateMaildirDirSnafu { path: &root })?;
            Database::create(&root).context(CreateDatabaseSnafu { path: &root })?
        };

        let mail_dir = root.join("gmail");
        let mail_tmp_dir = mail_dir.join("tmp");
        let mail_new_dir = mail_dir.join("new");
        for path in [&mail_tmp_dir, &mail_new_dir, &mail_dir.join("cur")] {
            crate::state::create_private_dir(path).context(CreateMaildirDirSnafu { path })?;
        }

        Ok(Self {
            db,
            mail_tmp_dir,
            mail_new_dir,
            ignore_tags: config.ignore_tags(),
        })
    }

    /// Current notmuch database revision (lastmod counter).
    pub fn revision(&self) -> u64 {
        self.db.revision().revision
    }

    /// All messages modified since the given revision, split into
    /// gmail-owned entries (by remote ID) and purely local files (by path).
    pub fn changed_since(
        &self,
        revision: u64,
    ) -> Result<(HashMap<gmail::Id, TagSet>, HashMap<PathBuf, TagSet>)> {
        self.search(&format!("lastmod:{}..", revision))
    }

    /// All gmail-owned messages known to the index.
    pub fn all_gmail_ids(&self) -> Result<HashMap<gmail::Id, TagSet>> {
        Ok(self.search("path:**")?.0)
    }

    fn search(
        &self,
        query_string: &str,
    ) -> Result<(HashMap<gmail::Id, TagSet>, HashMap<PathBuf, TagSet>)> {
        debug!("notmuch query: {}", query_string);

        let query = self
            .db
            .create_query(query_string)
            .with_context(|_| CreateNotmuchQuerySnafu {
                query: query_string,
            })?;
        let messages = query
            .search_messages()
            .with_context(|_| ExecuteNotmuchQuerySnafu {
                query: query_string,
            })?;

        let mut gmail = HashMap::new();
        let mut local_only = HashMap::new();
        for message in messages {
            let tags: TagSet = message
                .tags()
                .into_iter()
                .filter(|tag| !self.ignore_tags.contains(tag))
                .collect();
            for path in message.filenames() {
                match path
                    .file_name()
                    .and_then(|name| gmail_id_of(&name.to_string_lossy()))
                {
                    Some(id) => {
                        gmail.insert(id, tags.clone());
                    }
                    None => {
                        local_only.insert(path, tags.clone());
                    }
                }
            }
        }
        Ok((gmail, local_only))
    }

    /// Durably store one raw message under the maildir: written to `tmp/`,
    /// renamed into `new/`, timestamped with the remote delivery time.
    pub fn store(&self, raw: &[u8], id: &gmail::Id, internal_date_ms: u64) -> Result<PathBuf> {
        deliver(
            &self.mail_tmp_dir,
            &self.mail_new_dir,
            &synthetic_file_name(id),
            raw,
            internal_date_ms,
        )
    }

    /// Add a batch of stored messages to the index in a single transaction,
    /// tags appearing atomically per message.
    pub fn index(&self, messages: &HashMap<PathBuf, TagSet>) -> Result<()> {
        self.db.begin_atomic().context(BeginAtomicSnafu {})?;
        for (path, tags) in messages {
            let message = self.db.index_file(path, None).context(IndexFileSnafu {})?;
            message.freeze().context(UpdateTagsSnafu {})?;
            for tag in tags {
                message.add_tag(tag).context(UpdateTagsSnafu {})?;
            }
            message.thaw().context(UpdateTagsSnafu {})?;
        }
        self.db.end_atomic().context(EndAtomicSnafu {})?;
        Ok(())
    }

    /// Replace the tag sets of gmail-owned messages with the given ones.
    /// Messages missing from the index are logged and skipped.
    pub fn apply_tags(&self, updates: &HashMap<gmail::Id, TagSet>) -> Result<()> {
        let total = updates.len();
        self.db.begin_atomic().context(BeginAtomicSnafu {})?;
        for (n, (id, tags)) in updates.iter().enumerate() {
            let path = self.mail_new_dir.join(synthetic_file_name(id));
            let message = self
                .db
                .find_message_by_filename(&path)
                .context(FindMessageSnafu {})?;
            let message = match message {
                Some(message) => message,
                None => {
                    warn!(
                        "[{}/{}] message `{}' not found in notmuch db",
                        n + 1,
                        total,
                        path.to_string_lossy()
                    );
                    continue;
                }
            };
            message.freeze().context(UpdateTagsSnafu {})?;
            message.remove_all_tags().context(UpdateTagsSnafu {})?;
            for tag in tags {
                message.add_tag(tag).context(UpdateTagsSnafu {})?;
            }
            message.thaw().context(UpdateTagsSnafu {})?;
            debug!(
                "[{}/{}] message {} tags {:?} updated",
                n + 1,
                total,
                id,
                tags
            );
        }
        self.db.end_atomic().context(EndAtomicSnafu {})?;
        Ok(())
    }

    /// Remove messages deleted on the remote: index entry first (ignoring
    /// not-found), then the file if still present.
    pub fn delete(&self, ids: &HashSet<gmail::Id>) -> Result<()> {
        let total = ids.len();
        for (n, id) in ids.iter().enumerate() {
            let path = self.mail_new_dir.join(synthetic_file_name(id));
            if let Err(e) = self.db.remove_message(&path) {
                warn!("Message `{}': {}", path.to_string_lossy(), e);
            }
            if path.is_file() {
                fs::remove_file(&path).context(RemoveMailFileSnafu { path: &path })?;
            }
            debug!("[{}/{}] message {} deleted", n + 1, total, id);
        }
        Ok(())
    }

    /// Take ownership of a purely local file that now exists remotely:
    /// rename it under the synthetic gmail name and reindex it with the
    /// same tags.
    pub fn adopt(&self, path: &Path, id: &gmail::Id, tags: &TagSet) -> Result<PathBuf> {
        let dest = self.mail_new_dir.join(synthetic_file_name(id));
        fs::rename(path, &dest).context(RenameMailFileSnafu {
            from: path,
            to: &dest,
        })?;

        self.db.begin_atomic().context(BeginAtomicSnafu {})?;
        let message = self.db.index_file(&dest, None).context(IndexFileSnafu {})?;
        message.freeze().context(UpdateTagsSnafu {})?;
        message.remove_all_tags().context(UpdateTagsSnafu {})?;
        for tag in tags {
            message.add_tag(tag).context(UpdateTagsSnafu {})?;
        }
        message.thaw().context(UpdateTagsSnafu {})?;
        if let Err(e) = self.db.remove_message(&path) {
            debug!("old path `{}' not in index: {}", path.to_string_lossy(), e);
        }
        self.db.end_atomic().context(EndAtomicSnafu {})?;
        Ok(dest)
    }
}

fn synthetic_file_name(id: &gmail::Id) -> String {
    format!("gmail.{}:2,", id)
}

/// The remote ID of a gmail-owned maildir file name, or `None` for purely
/// local files.
fn gmail_id_of(file_name: &str) -> Option<gmail::Id> {
    lazy_static! {
        static ref MAIL_FILE: Regex = Regex::new(MAIL_PATTERN).unwrap();
    }
    MAIL_FILE
        .captures(file_name)
        .map(|captures| gmail::Id(captures.get(1).unwrap().as_str().to_string()))
}

fn deliver(
    tmp_dir: &Path,
    new_dir: &Path,
    file_name: &str,
    raw: &[u8],
    internal_date_ms: u64,
) -> Result<PathBuf> {
    let tmp_path = tmp_dir.join(file_name);
    write_private_file(&tmp_path, raw).context(WriteMailFileSnafu { path: &tmp_path })?;

    let msg_path = new_dir.join(file_name);
    fs::rename(&tmp_path, &msg_path).context(RenameMailFileSnafu {
        from: &tmp_path,
        to: &msg_path,
    })?;

    // Stamp the file with the remote delivery time; best effort only.
    let delivered = UNIX_EPOCH + Duration::from_millis(internal_date_ms);
    if let Err(e) = set_file_times(&msg_path, delivered) {
        debug!(
            "could not set times on `{}': {}",
            msg_path.to_string_lossy(),
            e
        );
    }
    Ok(msg_path)
}

fn write_private_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)?.write_all(contents)
}

fn set_file_times(path: &Path, time: SystemTime) -> io::Result<()> {
    let times = fs::FileTimes::new().set_accessed(time).set_modified(time);
    fs::File::options().append(true).open(path)?.set_times(times)
}
