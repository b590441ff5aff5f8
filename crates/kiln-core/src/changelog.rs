//! Change sets recorded by checkout.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One commit (or equivalent SCM change) included in a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub commit_id: String,
    /// User id of the author.
    pub author: String,
    pub message: String,
    #[serde(default)]
    pub affected_paths: Vec<String>,
}

/// The changes incorporated into a build since the previous one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogSet {
    pub entries: Vec<ChangeEntry>,
}

impl ChangeLogSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn authors(&self) -> BTreeSet<String> {
        self.entries.iter().map(|e| e.author.clone()).collect()
    }
}
