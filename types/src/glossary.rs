//! Glossary entry model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{EntryId, PostId, ThreadId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Confirmed,
    #[default]
    Tentative,
}

impl EntryStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Confirmed => "confirmed",
            EntryStatus::Tentative => "tentative",
        }
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown entry status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for EntryStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(EntryStatus::Confirmed),
            "tentative" => Ok(EntryStatus::Tentative),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlossaryEntry {
    pub id: EntryId,
    pub term: String,
    pub term_normalized: String,
    pub definition: String,
    pub status: EntryStatus,
    pub tags: Vec<String>,
    pub first_seen_post_id: PostId,
    pub first_seen_thread_id: ThreadId,
    pub last_updated_post_id: PostId,
    pub last_updated_thread_id: ThreadId,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::EntryStatus;

    #[test]
    fn status_parses_its_own_rendering() {
        for status in [EntryStatus::Confirmed, EntryStatus::Tentative] {
            assert_eq!(status.as_str().parse::<EntryStatus>().unwrap(), status);
        }
    }

    #[test]
    fn status_rejects_unknown() {
        assert!("maybe".parse::<EntryStatus>().is_err());
    }
}
