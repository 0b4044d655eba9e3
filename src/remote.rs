use std::{
    collections::{HashMap, HashSet},
    io,
    sync::atomic::AtomicBool,
    sync::Arc,
    time::Duration,
};

use crate::batch::{self, BatchState, Method, Reply, SubRequest, Transport, TransportFault};
use crate::gmail::{self, HistoryId};
use crate::labels::LabelMap;
use itertools::Itertools;
use log::{debug, trace, warn};
use serde::{de::DeserializeOwned, Serialize};
use snafu::prelude::*;

const API_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
/// Path prefix used inside batch sub-requests.
const API_PATH: &str = "/gmail/v1/users/me";
const BATCH_URL: &str = "https://gmail.googleapis.com/batch/gmail/v1";
const UPLOAD_URL: &str = "https://gmail.googleapis.com/upload/gmail/v1/users/me/messages";

const MINIMAL_FIELDS: &str = "id,historyId,labelIds";
const RAW_FIELDS: &str = "id,historyId,labelIds,internalDate,raw,sizeEstimate";
const HISTORY_FIELDS: &str =
    "history(id,messagesAdded,messagesDeleted,labelsAdded,labelsRemoved),nextPageToken,historyId";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Could not complete API request: {}", source))]
    Request { source: Box<ureq::Error> },

    #[snafu(display("Could not interpret API response: {}", source))]
    Response { source: io::Error },

    #[snafu(display("Could not deserialize API response: {}", source))]
    DeserializeResponse { source: serde_json::Error },

    #[snafu(display("Could not serialize API request: {}", source))]
    SerializeRequest { source: serde_json::Error },

    /// The server no longer retains the change log at our start point;
    /// callers fall back to a full scan.
    #[snafu(display("Server no longer retains history at the requested start point"))]
    HistoryTooOld,

    #[snafu(display("Could not complete batched request: {}", source))]
    Batch { source: batch::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Thin wrapper over a persistent `ureq` agent carrying the OAuth2 bearer
/// header.
pub struct HttpWrapper {
    /// Value of the HTTP Authorization header.
    authorization: String,
    agent: ureq::Agent,
}

impl HttpWrapper {
    fn new(access_token: &str, timeout: Option<Duration>) -> Self {
        let mut builder = ureq::AgentBuilder::new();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Self {
            authorization: format!("Bearer {}", access_token),
            agent: builder.build(),
        }
    }

    fn get_json<D: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<D> {
        let mut request = self.agent.get(url).set("Authorization", &self.authorization);
        for (param, value) in query {
            request = request.query(param, value);
        }
        let response = request.call().map_err(Box::new).context(RequestSnafu {})?;
        if log::log_enabled!(log::Level::Trace) {
            let json = response.into_string().context(ResponseSnafu {})?;
            trace!("GET response: {}", json);
            serde_json::from_str(&json).context(DeserializeResponseSnafu {})
        } else {
            response.into_json().context(ResponseSnafu {})
        }
    }

    fn post_json<S: Serialize, D: DeserializeOwned>(&self, url: &str, body: S) -> Result<D> {
        self.agent
            .post(url)
            .set("Authorization", &self.authorization)
            .send_json(body)
            .map_err(Box::new)
            .context(RequestSnafu {})?
            .into_json()
            .context(ResponseSnafu {})
    }

    fn post_bytes<D: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
        content_type: &str,
        body: &[u8],
    ) -> Result<D> {
        let mut request = self
            .agent
            .post(url)
            .set("Authorization", &self.authorization)
            .set("Content-Type", content_type);
        for (param, value) in query {
            request = request.query(param, value);
        }
        request
            .send_bytes(body)
            .map_err(Box::new)
            .context(RequestSnafu {})?
            .into_json()
            .context(ResponseSnafu {})
    }
}

impl Transport for HttpWrapper {
    fn round_trip(
        &self,
        content_type: &str,
        body: &str,
    ) -> std::result::Result<batch::HttpReply, TransportFault> {
        let result = self
            .agent
            .post(BATCH_URL)
            .set("Authorization", &self.authorization)
            .set("Content-Type", content_type)
            .send_string(body);
        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                // Drain the body so the connection can be reused.
                let body = response.into_string().unwrap_or_default();
                return Ok(batch::HttpReply {
                    status,
                    content_type: String::new(),
                    body,
                });
            }
            Err(ureq::Error::Transport(transport)) => {
                return Err(TransportFault {
                    message: transport.to_string(),
                })
            }
        };
        let content_type = response
            .header("Content-Type")
            .unwrap_or_default()
            .to_string();
        let status = response.status();
        let body = response.into_string().map_err(|e| TransportFault {
            message: e.to_string(),
        })?;
        Ok(batch::HttpReply {
            status,
            content_type,
            body,
        })
    }
}

/// Typed façade over the Gmail REST API.
pub struct Remote {
    http: HttpWrapper,
    cancel: Arc<AtomicBool>,
}

impl Remote {
    pub fn open(access_token: &str, timeout: Option<Duration>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            http: HttpWrapper::new(access_token, timeout),
            cancel,
        }
    }

    /// Refresh the mapper's label catalog from the server.
    pub fn refresh_labels(&self, map: &mut LabelMap) -> Result<()> {
        let response: gmail::ListLabelsResponse =
            self.http.get_json(&format!("{}/labels", API_URL), &[])?;
        debug!("got {} labels", response.labels.len());
        map.update_catalog(response.labels);
        Ok(())
    }

    /// Create a label server-side and insert it into the mapper's mirrors.
    pub fn create_label(&self, map: &mut LabelMap, name: &str) -> Result<gmail::LabelId> {
        let label: gmail::Label = self
            .http
            .post_json(&format!("{}/labels", API_URL), gmail::LabelCreate { name })?;
        debug!("created label `{}' as {}", name, label.id);
        let id = label.id.clone();
        map.insert(label);
        Ok(id)
    }

    /// Lazy pagination over all message IDs matching `query`, spam and
    /// trash included.
    pub fn message_pages(&self, query: String) -> MessagePages {
        MessagePages {
            http: &self.http,
            query,
            page_token: None,
            done: false,
        }
    }

    /// Lazy pagination over the change log starting just after `start_id`.
    /// The first request failing with HTTP 404 means the log has been
    /// truncated past our watermark (`HistoryTooOld`).
    pub fn history_pages(&self, start_id: HistoryId) -> HistoryPages {
        HistoryPages {
            http: &self.http,
            start_id,
            page_token: None,
            done: false,
        }
    }

    /// Batched fetch of message metadata (`format=minimal`). The sink is
    /// invoked once per retrieved message, in arbitrary order; bad messages
    /// (HTTP 400/404) are skipped.
    pub fn fetch_minimal<F>(&self, ids: impl IntoIterator<Item = gmail::Id>, sink: F) -> Result<()>
    where
        F: FnMut(gmail::MinimalMessage) -> std::result::Result<(), batch::SinkError>,
    {
        self.fetch(ids, "minimal", MINIMAL_FIELDS, sink)
    }

    /// Batched fetch of full raw messages (`format=raw`).
    pub fn fetch_raw<F>(&self, ids: impl IntoIterator<Item = gmail::Id>, sink: F) -> Result<()>
    where
        F: FnMut(gmail::RawMessage) -> std::result::Result<(), batch::SinkError>,
    {
        self.fetch(ids, "raw", RAW_FIELDS, sink)
    }

    fn fetch<D, F>(
        &self,
        ids: impl IntoIterator<Item = gmail::Id>,
        format: &str,
        fields: &str,
        mut sink: F,
    ) -> Result<()>
    where
        D: DeserializeOwned,
        F: FnMut(D) -> std::result::Result<(), batch::SinkError>,
    {
        let work: HashMap<gmail::Id, SubRequest> = ids
            .into_iter()
            .map(|id| {
                let path_and_query = format!(
                    "{}/messages/{}?format={}&fields={}",
                    API_PATH, id, format, fields
                );
                (
                    id,
                    SubRequest {
                        method: Method::Get,
                        path_and_query,
                        body: None,
                    },
                )
            })
            .collect();

        let mut state = BatchState::new(batch::MAX_CONTENT_BATCH);
        batch::run(&self.http, work, &mut state, self.cancel.as_ref(), |id, reply| {
            match reply {
                Reply::Payload(payload) => {
                    let message: D = serde_json::from_value(payload)?;
                    sink(message)?;
                }
                Reply::BadMessage { status } => {
                    debug!("message {} rejected with HTTP {}, skipping", id, status);
                }
            }
            Ok(())
        })
        .context(BatchSnafu {})
    }

    /// Batched label modifications. Empty patches are skipped; `on_done` is
    /// called once per applied modification.
    pub fn modify_labels<F>(
        &self,
        ops: &HashMap<gmail::Id, gmail::LabelPatch>,
        mut on_done: F,
    ) -> Result<()>
    where
        F: FnMut(&gmail::Id),
    {
        let work: HashMap<gmail::Id, SubRequest> = ops
            .iter()
            .filter(|(_, patch)| !patch.is_empty())
            .map(|(id, patch)| {
                let body = serde_json::to_string(patch).context(SerializeRequestSnafu {})?;
                Ok((
                    id.clone(),
                    SubRequest {
                        method: Method::Post,
                        path_and_query: format!("{}/messages/{}/modify", API_PATH, id),
                        body: Some(body),
                    },
                ))
            })
            .collect::<Result<_>>()?;

        let mut state = BatchState::new(batch::MAX_CONTENT_BATCH);
        batch::run(&self.http, work, &mut state, self.cancel.as_ref(), |id, reply| {
            match reply {
                Reply::Payload(_) => on_done(id),
                Reply::BadMessage { status } => {
                    warn!("label modify on {} rejected with HTTP {}", id, status);
                }
            }
            Ok(())
        })
        .context(BatchSnafu {})
    }

    /// Store a raw RFC 822 message in the account (does not send it).
    /// Returns the newly assigned message metadata.
    pub fn upload_message(
        &self,
        raw: &[u8],
        label_ids: Vec<gmail::LabelId>,
    ) -> Result<gmail::MinimalMessage> {
        const BOUNDARY: &str = "upload_notmuch_gmail";

        let metadata =
            serde_json::to_string(&gmail::MessageInsert { label_ids })
                .context(SerializeRequestSnafu {})?;
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{}\r\n",
                BOUNDARY, metadata
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!("--{}\r\nContent-Type: message/rfc822\r\n\r\n", BOUNDARY).as_bytes(),
        );
        body.extend_from_slice(raw);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());

        self.http.post_bytes(
            UPLOAD_URL,
            &[
                ("uploadType", "multipart"),
                ("internalDateSource", "dateHeader"),
                ("fields", MINIMAL_FIELDS),
            ],
            &format!("multipart/related; boundary={}", BOUNDARY),
            &body,
        )
    }
}

/// A page of message IDs with the server's total size estimate.
#[derive(Debug)]
pub struct MessagePage {
    pub size_estimate: u64,
    pub ids: Vec<gmail::Id>,
}

pub struct MessagePages<'a> {
    http: &'a HttpWrapper,
    query: String,
    page_token: Option<String>,
    done: bool,
}

impl Iterator for MessagePages<'_> {
    type Item = Result<MessagePage>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let mut query: Vec<(&str, &str)> =
                vec![("q", self.query.as_str()), ("includeSpamTrash", "true")];
            let token = self.page_token.take();
            if let Some(token) = &token {
                query.push(("pageToken", token.as_str()));
            }

            let response: gmail::ListMessagesResponse =
                match self.http.get_json(&format!("{}/messages", API_URL), &query) {
                    Ok(response) => response,
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                };

            self.page_token = response.next_page_token;
            self.done = self.page_token.is_none();
            if response.messages.is_empty() {
                continue;
            }
            return Some(Ok(MessagePage {
                size_estimate: response.result_size_estimate,
                ids: response.messages.into_iter().map(|m| m.id).collect(),
            }));
        }
        None
    }
}

pub struct HistoryPages<'a> {
    http: &'a HttpWrapper,
    start_id: HistoryId,
    page_token: Option<String>,
    done: bool,
}

impl Iterator for HistoryPages<'_> {
    type Item = Result<Vec<gmail::HistoryRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let start = self.start_id.to_string();
            let mut query: Vec<(&str, &str)> = vec![
                ("startHistoryId", start.as_str()),
                ("fields", HISTORY_FIELDS),
            ];
            let token = self.page_token.take();
            if let Some(token) = &token {
                query.push(("pageToken", token.as_str()));
            }

            let response: gmail::ListHistoryResponse =
                match self.http.get_json(&format!("{}/history", API_URL), &query) {
                    Ok(response) => response,
                    Err(Error::Request { source })
                        if matches!(*source, ureq::Error::Status(404, _)) =>
                    {
                        self.done = true;
                        return Some(Err(Error::HistoryTooOld));
                    }
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                };

            self.page_token = response.next_page_token;
            self.done = self.page_token.is_none();
            if response.history.is_empty() {
                continue;
            }
            return Some(Ok(response.history));
        }
        None
    }
}

/// The `messages.list` search query excluding every no-sync label.
pub fn no_sync_query(no_sync_labels: &HashSet<String>) -> String {
    no_sync_labels
        .iter()
        .sorted()
        .map(|label| format!("-in:{}", label))
        .join(" ")
}
