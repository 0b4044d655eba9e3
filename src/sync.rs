use crate::auth::{self, Authenticator, CredentialStore};
use crate::batch;
use crate::config::Config;
use crate::gmail::{self, HistoryId};
use crate::labels::LabelMap;
use crate::local::{self, Local, TagSet};
use crate::remote::{self, no_sync_query, Remote};
use crate::state::{self, Watermarks};
use fslock::LockFile;
use indicatif::ProgressBar;
use itertools::Itertools;
use log::{debug, warn};
use snafu::prelude::*;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use termcolor::{ColorSpec, StandardStream, WriteColor};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not create status dir `{}': {}", path.to_string_lossy(), source))]
    CreateStatusDir { path: PathBuf, source: io::Error },

    #[snafu(display("Could not open lock file `{}': {}", path.to_string_lossy(), source))]
    OpenLockFile { path: PathBuf, source: io::Error },

    #[snafu(display("Could not lock: {}", source))]
    Lock { source: io::Error },

    /// Another instance holds the lock. Reported as a successful no-op.
    #[snafu(display("Already running"))]
    AlreadyRunning,

    #[snafu(display("Could not log string: {}", source))]
    Log { source: io::Error },

    #[snafu(display("Could not authenticate against Gmail: {}", source))]
    Auth { source: auth::Error },

    #[snafu(display("Could not open local database: {}", source))]
    OpenLocal { source: local::Error },

    #[snafu(display("Could not list remote labels: {}", source))]
    ListLabels { source: remote::Error },

    #[snafu(display("Could not detect remote changes: {}", source))]
    DetectChanges { source: remote::Error },

    #[snafu(display("Could not index local changes: {}", source))]
    IndexLocalChanges { source: local::Error },

    #[snafu(display("Could not fetch new mail: {}", source))]
    FetchNewMail { source: remote::Error },

    #[snafu(display("Could not index new mail: {}", source))]
    IndexNewMail { source: local::Error },

    #[snafu(display("Could not push label changes: {}", source))]
    PushLabels { source: remote::Error },

    #[snafu(display("Could not create remote label: {}", source))]
    CreateLabel { source: remote::Error },

    #[snafu(display("Could not apply remote tag changes: {}", source))]
    ApplyTags { source: local::Error },

    #[snafu(display("Could not delete local messages: {}", source))]
    DeleteMessages { source: local::Error },

    #[snafu(display("Could not read local mail file `{}': {}", path.to_string_lossy(), source))]
    ReadLocalMail { path: PathBuf, source: io::Error },

    #[snafu(display("Could not upload local message: {}", source))]
    UploadLocal { source: remote::Error },

    #[snafu(display("Could not adopt uploaded message: {}", source))]
    AdoptLocal { source: local::Error },

    #[snafu(display("Could not save watermarks: {}", source))]
    SaveWatermarks { source: state::Error },

    #[snafu(display("Interrupted"))]
    Interrupted,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether this run was cut short by the user (exit code 2).
    pub fn is_interrupted(&self) -> bool {
        fn batch_interrupted(e: &remote::Error) -> bool {
            matches!(
                e,
                remote::Error::Batch {
                    source: batch::Error::Interrupted
                }
            )
        }
        match self {
            Error::Interrupted => true,
            Error::DetectChanges { source }
            | Error::FetchNewMail { source }
            | Error::PushLabels { source }
            | Error::CreateLabel { source }
            | Error::UploadLocal { source } => batch_interrupted(source),
            _ => false,
        }
    }
}

/// The unified product of change detection, whichever strategy produced it.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Gmail-owned messages whose tags changed locally since the last run.
    pub local_updated: HashMap<gmail::Id, TagSet>,
    /// Purely local files that changed since the last run.
    pub local_new: HashMap<PathBuf, TagSet>,
    /// Messages that exist remotely but not locally.
    pub remote_new: HashSet<gmail::Id>,
    /// Messages whose remote label set changed, with their new tag sets.
    pub remote_updated: HashMap<gmail::Id, TagSet>,
    /// Messages that disappeared remotely.
    pub remote_deleted: HashSet<gmail::Id>,
    /// Highest history ID observed while detecting.
    pub observed_history_id: Option<HistoryId>,
}

/// Fold one history record into the change set.
///
/// Additions and deletions are terminal for a message within one detection
/// pass: a label event on a message already known to be new or deleted is
/// ignored, and an addition or deletion clears any previously recorded
/// update. No-sync messages are dropped entirely.
fn apply_history_record(changes: &mut ChangeSet, record: &gmail::HistoryRecord, map: &LabelMap) {
    changes.observed_history_id = changes.observed_history_id.max(Some(record.id));

    for entry in &record.messages_added {
        let message = &entry.message;
        if map.message_tags(&message.label_ids).is_err() {
            debug!("dropping no-sync message {}", message.id);
            continue;
        }
        changes.remote_updated.remove(&message.id);
        changes.remote_deleted.remove(&message.id);
        changes.remote_new.insert(message.id.clone());
    }

    for entry in &record.messages_deleted {
        let message = &entry.message;
        if map.message_tags(&message.label_ids).is_err() {
            // Never stored locally, so there is nothing to delete.
            changes.remote_new.remove(&message.id);
            changes.remote_updated.remove(&message.id);
            continue;
        }
        changes.remote_updated.remove(&message.id);
        changes.remote_new.remove(&message.id);
        changes.remote_deleted.insert(message.id.clone());
    }

    for entry in record.labels_added.iter().chain(&record.labels_removed) {
        let message = &entry.message;
        if changes.remote_new.contains(&message.id)
            || changes.remote_deleted.contains(&message.id)
        {
            continue;
        }
        match map.message_tags(&message.label_ids) {
            Ok(tags) => {
                changes.remote_updated.insert(message.id.clone(), tags);
            }
            Err(_) => {
                debug!("dropping no-sync label event on {}", message.id);
            }
        }
    }
}

fn detect_incremental(
    remote: &Remote,
    map: &LabelMap,
    start_id: HistoryId,
) -> std::result::Result<ChangeSet, remote::Error> {
    let mut changes = ChangeSet::default();
    for page in remote.history_pages(start_id) {
        for record in page? {
            apply_history_record(&mut changes, &record, map);
        }
    }
    debug!(
        "incremental: {} new, {} updated, {} deleted, history {:?}",
        changes.remote_new.len(),
        changes.remote_updated.len(),
        changes.remote_deleted.len(),
        changes.observed_history_id
    );
    Ok(changes)
}

fn detect_full(
    remote: &Remote,
    map: &LabelMap,
    known_local: &HashMap<gmail::Id, TagSet>,
    query: String,
) -> Result<ChangeSet> {
    let mut changes = ChangeSet::default();

    let progress = ProgressBar::new(0);
    let mut all_remote: HashSet<gmail::Id> = HashSet::new();
    for page in remote.message_pages(query) {
        let page = page.context(DetectChangesSnafu {})?;
        progress.set_length(page.size_estimate);
        progress.inc(page.ids.len() as u64);
        all_remote.extend(page.ids);
    }
    progress.finish_and_clear();

    changes.remote_new = all_remote
        .iter()
        .filter(|id| !known_local.contains_key(*id))
        .cloned()
        .collect();
    changes.remote_deleted = known_local
        .keys()
        .filter(|id| !all_remote.contains(*id))
        .cloned()
        .collect();

    // Compare tag sets of everything present on both sides to find silent
    // label changes the missing history would have reported.
    let still_present: Vec<gmail::Id> = known_local
        .keys()
        .filter(|id| all_remote.contains(*id))
        .cloned()
        .collect();
    let mut observed = None;
    let mut remote_updated = HashMap::new();
    remote
        .fetch_minimal(still_present, |message| {
            observed = observed.max(Some(message.history_id));
            if let Ok(tags) = map.message_tags(&message.label_ids) {
                if known_local.get(&message.id) != Some(&tags) {
                    remote_updated.insert(message.id.clone(), tags);
                }
            }
            Ok(())
        })
        .context(DetectChangesSnafu {})?;
    changes.remote_updated = remote_updated;
    changes.observed_history_id = observed;

    debug!(
        "full scan: {} remote, {} new, {} updated, {} deleted",
        all_remote.len(),
        changes.remote_new.len(),
        changes.remote_updated.len(),
        changes.remote_deleted.len()
    );
    Ok(changes)
}

/// Drop conflicting entries from the losing side. Returns the conflicting
/// IDs for reporting. After this, no ID appears in both `local_updated` and
/// `remote_updated`.
fn resolve_conflicts(
    changes: &mut ChangeSet,
    push_local_tags: bool,
    local_wins: bool,
) -> Vec<gmail::Id> {
    let conflicts: Vec<gmail::Id> = changes
        .local_updated
        .keys()
        .filter(|id| changes.remote_updated.contains_key(*id))
        .cloned()
        .collect();
    for id in &conflicts {
        if push_local_tags && local_wins {
            changes.remote_updated.remove(id);
        } else {
            changes.local_updated.remove(id);
        }
    }
    conflicts
}

/// The add/remove tag sets that turn `remote` into `local`, in stable
/// order.
fn tag_diff(local: &TagSet, remote: &TagSet) -> (Vec<String>, Vec<String>) {
    let add = local.difference(remote).cloned().sorted().collect();
    let remove = remote.difference(local).cloned().sorted().collect();
    (add, remove)
}

fn label_id_for_tag(
    remote: &Remote,
    map: &mut LabelMap,
    tag: &str,
) -> Result<gmail::LabelId> {
    let name = map.label_for_tag(tag).to_string();
    if let Some(id) = map.label_id(&name) {
        return Ok(id.clone());
    }
    remote.create_label(map, &name).context(CreateLabelSnafu {})
}

/// Push locally changed tag sets to the server.
///
/// The current remote label sets are fetched first and only the difference
/// is sent, so remote label changes this run did not consider are not
/// clobbered. Messages that vanished remotely in the meantime are skipped.
fn push_local_changes(
    remote: &Remote,
    map: &mut LabelMap,
    local_updated: &HashMap<gmail::Id, TagSet>,
) -> Result<usize> {
    let mut current: HashMap<gmail::Id, TagSet> = HashMap::new();
    remote
        .fetch_minimal(local_updated.keys().cloned(), |message| {
            if let Ok(tags) = map.message_tags(&message.label_ids) {
                current.insert(message.id.clone(), tags);
            }
            Ok(())
        })
        .context(PushLabelsSnafu {})?;

    let mut ops: HashMap<gmail::Id, gmail::LabelPatch> = HashMap::new();
    for (id, remote_tags) in &current {
        let local_tags = &local_updated[id];
        let (add, remove) = tag_diff(local_tags, remote_tags);
        let mut patch = gmail::LabelPatch::default();
        for tag in &add {
            patch
                .add_label_ids
                .push(label_id_for_tag(remote, map, tag)?);
        }
        for tag in &remove {
            let name = map.label_for_tag(tag).to_string();
            match map.label_id(&name) {
                Some(label_id) => patch.remove_label_ids.push(label_id.clone()),
                // A tag that never existed as a label cannot be removed
                // server-side.
                None => debug!("no label for tag `{}', nothing to remove", tag),
            }
        }
        if !patch.is_empty() {
            ops.insert(id.clone(), patch);
        }
    }

    let pushed = ops.len();
    remote
        .modify_labels(&ops, |id| debug!("pushed label changes to {}", id))
        .context(PushLabelsSnafu {})?;
    Ok(pushed)
}

/// Fetch all new remote messages in raw form, store them in the maildir and
/// index them in chunks. Returns the highest history ID seen and the number
/// of messages ingested.
fn fetch_new_mail(
    remote: &Remote,
    local: &Local,
    map: &LabelMap,
    ids: HashSet<gmail::Id>,
    index_batch_size: usize,
) -> Result<(Option<HistoryId>, usize)> {
    let progress = ProgressBar::new(ids.len() as u64);
    let mut pending: HashMap<PathBuf, TagSet> = HashMap::new();
    let mut observed = None;
    let mut ingested = 0usize;

    remote
        .fetch_raw(ids, |message| {
            observed = observed.max(Some(message.history_id));
            progress.inc(1);

            let tags = match map.message_tags(&message.label_ids) {
                Ok(tags) => tags,
                // A no-sync label slipped through the exclusion query; drop
                // the message.
                Err(_) => return Ok(()),
            };
            let raw = base64::decode_config(&message.raw, base64::URL_SAFE)?;
            let path = local.store(&raw, &message.id, message.internal_date)?;
            debug!(
                "stored {} (~{} bytes) as `{}'",
                message.id,
                message.size_estimate,
                path.to_string_lossy()
            );
            pending.insert(path, tags);
            ingested += 1;
            if pending.len() >= index_batch_size {
                local.index(&pending)?;
                pending.clear();
            }
            Ok(())
        })
        .context(FetchNewMailSnafu {})?;

    if !pending.is_empty() {
        local.index(&pending).context(IndexNewMailSnafu {})?;
    }
    progress.finish_and_clear();
    Ok((observed, ingested))
}

/// Upload purely local drafts/sent messages and adopt them under their new
/// remote identity.
fn upload_local_new(
    remote: &Remote,
    local: &Local,
    map: &mut LabelMap,
    local_new: &HashMap<PathBuf, TagSet>,
    config: &Config,
) -> Result<usize> {
    let mut uploaded = 0;
    for (path, tags) in local_new {
        let eligible = (config.core.upload_drafts && tags.contains("draft"))
            || (config.core.upload_sent && tags.contains("sent"));
        if !eligible {
            continue;
        }
        let raw = fs::read(path).context(ReadLocalMailSnafu { path })?;
        let label_ids = tags
            .iter()
            .sorted()
            .map(|tag| label_id_for_tag(remote, map, tag))
            .collect::<Result<Vec<_>>>()?;
        let message = remote
            .upload_message(&raw, label_ids)
            .context(UploadLocalSnafu {})?;
        local
            .adopt(path, &message.id, tags)
            .context(AdoptLocalSnafu {})?;
        debug!(
            "uploaded `{}' as message {}",
            path.to_string_lossy(),
            message.id
        );
        uploaded += 1;
    }
    Ok(uploaded)
}

fn info(stdout: &mut StandardStream, info_color_spec: &ColorSpec, line: &str) -> Result<()> {
    stdout.set_color(info_color_spec).context(LogSnafu {})?;
    write!(stdout, "{}", line).context(LogSnafu {})?;
    stdout.reset().context(LogSnafu {})?;
    writeln!(stdout).context(LogSnafu {})?;
    stdout.flush().context(LogSnafu {})
}

/// One complete synchronization run.
pub fn sync(
    stdout: &mut StandardStream,
    info_color_spec: ColorSpec,
    config: Config,
) -> Result<()> {
    let status_dir = config.status_dir();
    state::create_private_dir(&status_dir).context(CreateStatusDirSnafu { path: &status_dir })?;

    // Grab the lock; a second instance is a cheerful no-op.
    let lock_path = status_dir.join("lock");
    let mut lock = LockFile::open(&lock_path).context(OpenLockFileSnafu { path: &lock_path })?;
    ensure!(lock.try_lock().context(LockSnafu {})?, AlreadyRunningSnafu);

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst)) {
            warn!("could not install interrupt handler: {}", e);
        }
    }

    // Authenticate before anything touches the network.
    let auth = Authenticator::new(CredentialStore::open(&status_dir), config.http_timeout());
    let token = auth.access_token().context(AuthSnafu {})?;

    let watermarks = Watermarks::open(&status_dir);
    let local = Local::open(&config).context(OpenLocalSnafu {})?;
    let remote = Remote::open(&token, config.http_timeout(), cancel.clone());

    let mut map = LabelMap::new(&config);
    remote.refresh_labels(&mut map).context(ListLabelsSnafu {})?;

    let last_history_id = watermarks.history_id();
    let last_revision = watermarks.notmuch_revision();
    debug!(
        "watermarks: history_id={:?} notmuch_rev={:?}",
        last_history_id, last_revision
    );

    info(stdout, &info_color_spec, "Detecting changes...")?;
    let full_scan = || -> Result<ChangeSet> {
        let known_local = local.all_gmail_ids().context(IndexLocalChangesSnafu {})?;
        detect_full(
            &remote,
            &map,
            &known_local,
            no_sync_query(&config.no_sync_labels()),
        )
    };
    let mut changes = match last_history_id {
        Some(start_id) => match detect_incremental(&remote, &map, start_id) {
            Ok(changes) => changes,
            Err(remote::Error::HistoryTooOld) => {
                warn!(
                    "server history no longer reaches {}, falling back to a full scan",
                    start_id
                );
                full_scan()?
            }
            Err(e) => return Err(e).context(DetectChangesSnafu {}),
        },
        None => full_scan()?,
    };

    // Local side of the change set. With no recorded revision there is
    // nothing trustworthy to diff against, so local edits are not pushed on
    // a first run.
    if let Some(revision) = last_revision {
        let (local_updated, local_new) = local
            .changed_since(revision)
            .context(IndexLocalChangesSnafu {})?;
        changes.local_updated = local_updated
            .into_iter()
            .filter(|(id, _)| !changes.remote_deleted.contains(id))
            .collect();
        changes.local_new = local_new;
    }

    writeln!(
        stdout,
        "{} new, {} changed, {} deleted remotely; {} changed, {} only exist locally",
        changes.remote_new.len(),
        changes.remote_updated.len(),
        changes.remote_deleted.len(),
        changes.local_updated.len(),
        changes.local_new.len(),
    )
    .context(LogSnafu {})?;

    // Fetch and ingest new remote messages.
    let mut fetched_history_id = None;
    if !changes.remote_new.is_empty() {
        info(stdout, &info_color_spec, "Downloading new mail...")?;
        let ids = std::mem::take(&mut changes.remote_new);
        let (observed, ingested) = fetch_new_mail(
            &remote,
            &local,
            &map,
            ids,
            config.core.index_batch_size,
        )?;
        fetched_history_id = observed;
        writeln!(stdout, "{} messages indexed", ingested).context(LogSnafu {})?;
    }

    ensure!(!cancel.load(Ordering::SeqCst), InterruptedSnafu);

    // Merge tag changes under the configured conflict policy.
    let conflicts = resolve_conflicts(
        &mut changes,
        config.core.push_local_tags,
        config.core.local_wins,
    );
    if !conflicts.is_empty() {
        let winner = if config.core.push_local_tags && config.core.local_wins {
            "local"
        } else {
            "remote"
        };
        debug!(
            "{} conflicting messages, {} side wins: {:?}",
            conflicts.len(),
            winner,
            conflicts
        );
    }

    if config.core.push_local_tags && !changes.local_updated.is_empty() {
        info(stdout, &info_color_spec, "Pushing local tag changes...")?;
        let pushed = push_local_changes(&remote, &mut map, &changes.local_updated)?;
        writeln!(stdout, "{} messages updated remotely", pushed).context(LogSnafu {})?;
    }

    if !changes.remote_updated.is_empty() {
        info(stdout, &info_color_spec, "Applying remote tag changes...")?;
        local
            .apply_tags(&changes.remote_updated)
            .context(ApplyTagsSnafu {})?;
    }

    if !changes.remote_deleted.is_empty() {
        info(stdout, &info_color_spec, "Deleting messages removed remotely...")?;
        local
            .delete(&changes.remote_deleted)
            .context(DeleteMessagesSnafu {})?;
    }

    if (config.core.upload_drafts || config.core.upload_sent) && !changes.local_new.is_empty() {
        ensure!(!cancel.load(Ordering::SeqCst), InterruptedSnafu);
        let uploaded = upload_local_new(&remote, &local, &mut map, &changes.local_new, &config)?;
        if uploaded > 0 {
            writeln!(stdout, "{} local messages uploaded", uploaded).context(LogSnafu {})?;
        }
    }

    // Advance the watermarks only now that every phase has completed.
    let final_history_id = [
        last_history_id,
        changes.observed_history_id,
        fetched_history_id,
    ]
    .into_iter()
    .flatten()
    .max();
    if let Some(history_id) = final_history_id {
        watermarks
            .set_history_id(history_id)
            .context(SaveWatermarksSnafu {})?;
    }
    watermarks
        .set_notmuch_revision(local.revision())
        .context(SaveWatermarksSnafu {})?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> LabelMap {
        LabelMap::new(&Config::default())
    }

    fn id(s: &str) -> gmail::Id {
        gmail::Id(s.to_string())
    }

    fn tags(names: &[&str]) -> TagSet {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn entry(message_id: &str, labels: &[&str]) -> gmail::HistoryMessageEntry {
        serde_json::from_value(serde_json::json!({
            "message": {"id": message_id, "labelIds": labels}
        }))
        .unwrap()
    }

    fn record(history_id: u64) -> gmail::HistoryRecord {
        serde_json::from_value(serde_json::json!({"id": history_id.to_string()})).unwrap()
    }

    #[test]
    fn added_message_lands_in_remote_new() {
        let mut changes = ChangeSet::default();
        let mut r = record(101);
        r.messages_added.push(entry("a1", &["INBOX", "UNREAD"]));
        apply_history_record(&mut changes, &r, &map());

        assert!(changes.remote_new.contains(&id("a1")));
        assert!(changes.remote_updated.is_empty());
        assert_eq!(changes.observed_history_id, Some(101));
    }

    #[test]
    fn label_event_computes_full_tag_set() {
        let mut changes = ChangeSet::default();
        let mut r = record(150);
        r.labels_added
            .push(entry("a1", &["INBOX", "UNREAD", "STARRED"]));
        apply_history_record(&mut changes, &r, &map());

        assert_eq!(
            changes.remote_updated[&id("a1")],
            tags(&["inbox", "unread", "starred"])
        );
        assert_eq!(changes.observed_history_id, Some(150));
    }

    #[test]
    fn addition_supersedes_earlier_label_events() {
        let mut changes = ChangeSet::default();
        let mut first = record(1);
        first.labels_added.push(entry("a1", &["INBOX"]));
        let mut second = record(2);
        second.messages_added.push(entry("a1", &["INBOX"]));
        apply_history_record(&mut changes, &first, &map());
        apply_history_record(&mut changes, &second, &map());

        assert!(changes.remote_new.contains(&id("a1")));
        assert!(!changes.remote_updated.contains_key(&id("a1")));
    }

    #[test]
    fn label_events_on_new_or_deleted_messages_are_ignored() {
        let mut changes = ChangeSet::default();
        let mut first = record(1);
        first.messages_added.push(entry("a1", &["INBOX"]));
        first.messages_deleted.push(entry("b2", &[]));
        let mut second = record(2);
        second.labels_added.push(entry("a1", &["INBOX", "STARRED"]));
        second.labels_removed.push(entry("b2", &["INBOX"]));
        apply_history_record(&mut changes, &first, &map());
        apply_history_record(&mut changes, &second, &map());

        assert!(changes.remote_updated.is_empty());
        assert!(changes.remote_new.contains(&id("a1")));
        assert!(changes.remote_deleted.contains(&id("b2")));
    }

    #[test]
    fn deletion_supersedes_everything() {
        let mut changes = ChangeSet::default();
        let mut first = record(1);
        first.messages_added.push(entry("a1", &["INBOX"]));
        first.labels_added.push(entry("c3", &["INBOX"]));
        let mut second = record(2);
        second.messages_deleted.push(entry("a1", &[]));
        second.messages_deleted.push(entry("c3", &[]));
        apply_history_record(&mut changes, &first, &map());
        apply_history_record(&mut changes, &second, &map());

        assert!(changes.remote_new.is_empty());
        assert!(changes.remote_updated.is_empty());
        assert_eq!(changes.remote_deleted.len(), 2);
    }

    #[test]
    fn no_sync_messages_never_enter_the_change_set() {
        let mut changes = ChangeSet::default();
        let mut r = record(1);
        r.messages_added.push(entry("a1", &["INBOX", "CHATS"]));
        r.labels_added.push(entry("b2", &["CHATS"]));
        r.messages_deleted.push(entry("c3", &["CHATS"]));
        apply_history_record(&mut changes, &r, &map());

        assert!(changes.remote_new.is_empty());
        assert!(changes.remote_updated.is_empty());
        assert!(changes.remote_deleted.is_empty());
        // The record still advances the observed watermark.
        assert_eq!(changes.observed_history_id, Some(1));
    }

    #[test]
    fn conflict_remote_wins_by_default() {
        let mut changes = ChangeSet::default();
        changes
            .local_updated
            .insert(id("x"), tags(&["inbox", "important"]));
        changes.remote_updated.insert(id("x"), tags(&["inbox"]));

        let conflicts = resolve_conflicts(&mut changes, true, false);
        assert_eq!(conflicts, vec![id("x")]);
        assert!(!changes.local_updated.contains_key(&id("x")));
        assert_eq!(changes.remote_updated[&id("x")], tags(&["inbox"]));
    }

    #[test]
    fn conflict_local_wins_when_configured() {
        let mut changes = ChangeSet::default();
        changes
            .local_updated
            .insert(id("x"), tags(&["inbox", "important"]));
        changes.remote_updated.insert(id("x"), tags(&["inbox"]));

        let conflicts = resolve_conflicts(&mut changes, true, true);
        assert_eq!(conflicts, vec![id("x")]);
        assert!(!changes.remote_updated.contains_key(&id("x")));
        assert_eq!(
            changes.local_updated[&id("x")],
            tags(&["inbox", "important"])
        );
    }

    #[test]
    fn local_wins_requires_push_local_tags() {
        let mut changes = ChangeSet::default();
        changes.local_updated.insert(id("x"), tags(&["inbox"]));
        changes.remote_updated.insert(id("x"), tags(&["starred"]));

        // local_wins without push_local_tags still lets the remote win.
        resolve_conflicts(&mut changes, false, true);
        assert!(!changes.local_updated.contains_key(&id("x")));
        assert!(changes.remote_updated.contains_key(&id("x")));
    }

    #[test]
    fn resolution_leaves_no_shared_ids() {
        for (push, wins) in [(true, true), (true, false), (false, true), (false, false)] {
            let mut changes = ChangeSet::default();
            for n in 0..5 {
                let shared = id(&format!("{:x}", n));
                changes.local_updated.insert(shared.clone(), tags(&["a"]));
                changes.remote_updated.insert(shared, tags(&["b"]));
            }
            changes.local_updated.insert(id("aa"), tags(&["a"]));
            changes.remote_updated.insert(id("bb"), tags(&["b"]));

            resolve_conflicts(&mut changes, push, wins);
            let shared: Vec<_> = changes
                .local_updated
                .keys()
                .filter(|id| changes.remote_updated.contains_key(*id))
                .collect();
            assert!(shared.is_empty());
            // Non-conflicting entries always survive.
            assert!(changes.local_updated.contains_key(&id("aa")));
            assert!(changes.remote_updated.contains_key(&id("bb")));
        }
    }

    #[test]
    fn tag_diff_minimal_patch() {
        let (add, remove) = tag_diff(&tags(&["inbox", "important"]), &tags(&["inbox"]));
        assert_eq!(add, vec!["important"]);
        assert!(remove.is_empty());

        let (add, remove) = tag_diff(&tags(&["inbox"]), &tags(&["inbox", "unread"]));
        assert!(add.is_empty());
        assert_eq!(remove, vec!["unread"]);

        let (add, remove) = tag_diff(&tags(&["a"]), &tags(&["a"]));
        assert!(add.is_empty());
        assert!(remove.is_empty());
    }
}
