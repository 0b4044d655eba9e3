mod request;
mod response;

use core::fmt;

pub use request::*;
pub use response::*;
use serde::{Deserialize, Serialize};

/// Opaque Gmail message ID (lowercase hex string).
#[derive(Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize, Debug, Clone)]
pub struct Id(pub String);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque Gmail label ID, e.g. `INBOX` or `Label_42`.
#[derive(Eq, PartialEq, Hash, Serialize, Deserialize, Debug, Clone)]
pub struct LabelId(pub String);

impl fmt::Display for LabelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Monotonic server-assigned cursor for the account's change log.
pub type HistoryId = u64;
