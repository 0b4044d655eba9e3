use log::debug;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::state::create_private_dir;

/// OAuth2 scope required for bidirectional synchronization.
const SCOPE: &str = "https://www.googleapis.com/auth/gmail.modify";

/// Out-of-band redirect: the user pastes the verification code back.
const REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";

const CLIENT_SECRET_FILE: &str = "client_secret.json";
const CREDENTIALS_FILE: &str = "oauth.json";

/// Seconds of remaining validity below which a token is refreshed.
const EXPIRY_MARGIN: u64 = 60;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display(
        "Could not read OAuth2 client secret `{}' (download the installed-application \
         client_secret.json from the Google API console into the status dir): {}",
        filename.to_string_lossy(),
        source
    ))]
    ReadClientSecret {
        filename: PathBuf,
        source: io::Error,
    },

    #[snafu(display("Could not parse OAuth2 client secret `{}': {}", filename.to_string_lossy(), source))]
    ParseClientSecret {
        filename: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Could not read stored credentials `{}': {}", filename.to_string_lossy(), source))]
    ReadCredentials {
        filename: PathBuf,
        source: io::Error,
    },

    #[snafu(display("Could not parse stored credentials `{}': {}", filename.to_string_lossy(), source))]
    ParseCredentials {
        filename: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Could not write credentials `{}': {}", filename.to_string_lossy(), source))]
    WriteCredentials {
        filename: PathBuf,
        source: io::Error,
    },

    #[snafu(display("Not authenticated; run `notmuch-gmail auth' first"))]
    NoCredentials {},

    #[snafu(display("Token request failed: {}", source))]
    TokenRequest { source: Box<ureq::Error> },

    #[snafu(display("Could not interpret token response: {}", source))]
    TokenResponse { source: io::Error },

    #[snafu(display("Could not read verification code: {}", source))]
    ReadVerificationCode { source: io::Error },

    #[snafu(display("Empty verification code"))]
    EmptyVerificationCode {},
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The `installed` stanza of a Google API console client secret document.
#[derive(Debug, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
}

#[derive(Debug, Deserialize)]
struct ClientSecretFile {
    installed: ClientSecret,
}

/// Stored OAuth2 tokens. The engine holds a read-only view; only the auth
/// flow and refresh mutate the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry of `access_token` in seconds since the epoch.
    pub expiry: u64,
}

/// On-disk credential storage under the status dir.
pub struct CredentialStore {
    status_dir: PathBuf,
}

impl CredentialStore {
    pub fn open(status_dir: impl Into<PathBuf>) -> Self {
        Self {
            status_dir: status_dir.into(),
        }
    }

    pub fn client_secret(&self) -> Result<ClientSecret> {
        let filename = self.status_dir.join(CLIENT_SECRET_FILE);
        let contents =
            fs::read_to_string(&filename).context(ReadClientSecretSnafu { filename: &filename })?;
        let file: ClientSecretFile =
            serde_json::from_str(&contents).context(ParseClientSecretSnafu { filename })?;
        Ok(file.installed)
    }

    pub fn load(&self) -> Result<Option<Credentials>> {
        let filename = self.status_dir.join(CREDENTIALS_FILE);
        let contents = match fs::read_to_string(&filename) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(ReadCredentialsSnafu { filename }),
        };
        if contents.trim().is_empty() {
            return Ok(None);
        }
        let credentials =
            serde_json::from_str(&contents).context(ParseCredentialsSnafu { filename })?;
        Ok(Some(credentials))
    }

    pub fn save(&self, credentials: &Credentials) -> Result<()> {
        let filename = self.status_dir.join(CREDENTIALS_FILE);
        create_private_dir(&self.status_dir).context(WriteCredentialsSnafu {
            filename: &self.status_dir,
        })?;
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = options
            .open(&filename)
            .context(WriteCredentialsSnafu { filename: &filename })?;
        serde_json::to_writer_pretty(&file, credentials)
            .map_err(io::Error::from)
            .context(WriteCredentialsSnafu { filename })?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
    refresh_token: Option<String>,
}

/// OAuth2 installed-application flow and token refresh over the same `ureq`
/// idiom as the rest of the remote plumbing.
pub struct Authenticator {
    store: CredentialStore,
    agent: ureq::Agent,
}

impl Authenticator {
    pub fn new(store: CredentialStore, timeout: Option<std::time::Duration>) -> Self {
        let mut builder = ureq::AgentBuilder::new();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Self {
            store,
            agent: builder.build(),
        }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    /// A bearer token valid for at least `EXPIRY_MARGIN` more seconds,
    /// refreshing and re-persisting if needed.
    pub fn access_token(&self) -> Result<String> {
        let credentials = self.store.load()?.context(NoCredentialsSnafu {})?;
        if credentials.expiry > now_epoch() + EXPIRY_MARGIN {
            return Ok(credentials.access_token);
        }
        debug!("access token expired, refreshing");
        let refreshed = self.refresh(credentials)?;
        self.store.save(&refreshed)?;
        Ok(refreshed.access_token)
    }

    fn refresh(&self, credentials: Credentials) -> Result<Credentials> {
        let secret = self.store.client_secret()?;
        let grant: TokenGrant = self
            .agent
            .post(&secret.token_uri)
            .send_form(&[
                ("client_id", secret.client_id.as_str()),
                ("client_secret", secret.client_secret.as_str()),
                ("refresh_token", credentials.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .map_err(Box::new)
            .context(TokenRequestSnafu {})?
            .into_json()
            .context(TokenResponseSnafu {})?;
        Ok(Credentials {
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .unwrap_or(credentials.refresh_token),
            expiry: now_epoch() + grant.expires_in,
        })
    }

    /// Run the interactive flow: show the consent URL, prompt for the
    /// verification code, exchange it and persist the credentials.
    pub fn authenticate(&self, no_browser: bool) -> Result<()> {
        let secret = self.store.client_secret()?;
        let url = authorize_url(&secret);

        if no_browser {
            println!("Open the following URL in a browser:\n\n{}\n", url);
        } else {
            println!("Your browser has been opened to visit:\n\n{}\n", url);
            println!(
                "If your browser is on a different machine then exit and re-run with\n\
                 the --no-browser command line option."
            );
            if let Err(e) = Command::new("xdg-open").arg(&url).spawn() {
                debug!("could not spawn browser: {}", e);
            }
        }

        print!("Enter verification code: ");
        io::stdout().flush().context(ReadVerificationCodeSnafu {})?;
        let mut code = String::new();
        io::stdin()
            .lock()
            .read_line(&mut code)
            .context(ReadVerificationCodeSnafu {})?;
        let code = code.trim();
        ensure!(!code.is_empty(), EmptyVerificationCodeSnafu {});

        let grant: TokenGrant = self
            .agent
            .post(&secret.token_uri)
            .send_form(&[
                ("client_id", secret.client_id.as_str()),
                ("client_secret", secret.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", REDIRECT_URI),
                ("grant_type", "authorization_code"),
            ])
            .map_err(Box::new)
            .context(TokenRequestSnafu {})?
            .into_json()
            .context(TokenResponseSnafu {})?;

        self.store.save(&Credentials {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.unwrap_or_default(),
            expiry: now_epoch() + grant.expires_in,
        })?;
        Ok(())
    }
}

fn authorize_url(secret: &ClientSecret) -> String {
    format!(
        "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent",
        secret.auth_uri,
        percent_encode(&secret.client_id),
        percent_encode(REDIRECT_URI),
        percent_encode(SCOPE),
    )
}

/// Minimal query-component percent encoding (everything but unreserved
/// characters).
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn credentials_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::open(dir.path().join("status"));
        assert!(store.load().unwrap().is_none());

        let credentials = Credentials {
            access_token: "ya29.token".to_string(),
            refresh_token: "1//refresh".to_string(),
            expiry: 1_700_000_000,
        };
        store.save(&credentials).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.access_token, "ya29.token");
        assert_eq!(loaded.refresh_token, "1//refresh");
        assert_eq!(loaded.expiry, 1_700_000_000);
    }

    #[test]
    fn empty_credentials_file_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CREDENTIALS_FILE), "").unwrap();
        let store = CredentialStore::open(dir.path());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn client_secret_installed_stanza() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CLIENT_SECRET_FILE),
            r#"{
                "installed": {
                    "client_id": "id.apps.googleusercontent.com",
                    "client_secret": "secret",
                    "auth_uri": "https://accounts.google.com/o/oauth2/auth",
                    "token_uri": "https://oauth2.googleapis.com/token",
                    "redirect_uris": ["urn:ietf:wg:oauth:2.0:oob", "http://localhost"]
                }
            }"#,
        )
        .unwrap();
        let store = CredentialStore::open(dir.path());
        let secret = store.client_secret().unwrap();
        assert_eq!(secret.client_id, "id.apps.googleusercontent.com");
        assert_eq!(secret.token_uri, "https://oauth2.googleapis.com/token");
    }

    #[test]
    fn authorize_url_carries_scope_and_client() {
        let secret = ClientSecret {
            client_id: "abc".to_string(),
            client_secret: "shh".to_string(),
            auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
        };
        let url = authorize_url(&secret);
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/auth?client_id=abc"));
        assert!(url.contains("gmail.modify"));
        assert!(url.contains("access_type=offline"));
    }

    #[test]
    fn percent_encoding_reserved_characters() {
        assert_eq!(percent_encode("a b:c/d"), "a%20b%3Ac%2Fd");
        assert_eq!(percent_encode("plain-text_1.2~"), "plain-text_1.2~");
    }
}
