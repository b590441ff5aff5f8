//! Build results, ordered from best to worst.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Outcome of a build.
///
/// The declaration order is the "worseness" order: combining two results
/// always keeps the worse one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Success,
    Unstable,
    Failure,
    NotBuilt,
    Aborted,
}

impl BuildResult {
    pub fn is_worse_than(self, other: BuildResult) -> bool {
        self > other
    }

    pub fn is_better_or_equal_to(self, other: BuildResult) -> bool {
        self <= other
    }

    /// The worse of the two.
    pub fn combine(self, other: BuildResult) -> BuildResult {
        self.max(other)
    }

    /// Completed and produced usable output (lastSuccessful semantics).
    pub fn is_successful(self) -> bool {
        self.is_better_or_equal_to(BuildResult::Unstable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildResult::Success => "SUCCESS",
            BuildResult::Unstable => "UNSTABLE",
            BuildResult::Failure => "FAILURE",
            BuildResult::NotBuilt => "NOT_BUILT",
            BuildResult::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for BuildResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(BuildResult::Success),
            "UNSTABLE" => Ok(BuildResult::Unstable),
            "FAILURE" => Ok(BuildResult::Failure),
            "NOT_BUILT" => Ok(BuildResult::NotBuilt),
            "ABORTED" => Ok(BuildResult::Aborted),
            other => Err(Error::InvalidInput(format!("unknown build result: {}", other))),
        }
    }
}
