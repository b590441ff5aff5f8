//! Fingerprints: content-hash records of which builds produced and used an artifact.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{BuildPtr, Error, Result};

/// Half-open range of build numbers `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u32,
    pub end: u32,
}

impl Range {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// The range holding just `n`. `u32::MAX` cannot be represented.
    pub fn single(n: u32) -> Result<Self> {
        n.checked_add(1)
            .map(|end| Self::new(n, end))
            .ok_or_else(|| Error::InvalidInput(format!("build number {} out of range", n)))
    }

    pub fn includes(&self, n: u32) -> bool {
        self.start <= n && n < self.end
    }

    pub fn is_single(&self) -> bool {
        self.end == self.start + 1
    }
}

/// Sorted, non-overlapping, non-adjacent set of build-number ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_numbers(numbers: impl IntoIterator<Item = u32>) -> Result<Self> {
        let mut rs = Self::new();
        for n in numbers {
            rs.add(n)?;
        }
        Ok(rs)
    }

    pub fn ranges(&self) -> &[Range] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn includes(&self, n: u32) -> bool {
        self.ranges.iter().any(|r| r.includes(n))
    }

    pub fn add(&mut self, n: u32) -> Result<()> {
        self.add_range(Range::single(n)?);
        Ok(())
    }

    pub fn add_range(&mut self, range: Range) {
        if range.start >= range.end {
            return;
        }
        self.ranges.push(range);
        self.normalize();
    }

    /// Union with another set.
    pub fn add_all(&mut self, other: &RangeSet) {
        if other.is_empty() {
            return;
        }
        self.ranges.extend_from_slice(&other.ranges);
        self.normalize();
    }

    /// All numbers, ascending.
    pub fn list_numbers(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().flat_map(|r| r.start..r.end)
    }

    /// All numbers, descending.
    pub fn list_numbers_reverse(&self) -> impl Iterator<Item = u32> + '_ {
        self.ranges.iter().rev().flat_map(|r| (r.start..r.end).rev())
    }

    pub fn max(&self) -> Option<u32> {
        self.ranges.last().map(|r| r.end - 1)
    }

    fn normalize(&mut self) {
        self.ranges.sort_by_key(|r| r.start);
        let mut merged: Vec<Range> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }
}

impl fmt::Display for RangeSet {
    /// `1-3,5`: inclusive ranges, comma separated.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            if r.is_single() {
                write!(f, "{}", r.start)?;
            } else {
                write!(f, "{}-{}", r.start, r.end - 1)?;
            }
        }
        Ok(())
    }
}

impl FromStr for RangeSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut rs = RangeSet::new();
        let invalid = |part: &str| Error::InvalidInput(format!("invalid range '{}' in '{}'", part, s));
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((a, b)) => {
                    let start: u32 = a.trim().parse().map_err(|_| invalid(part))?;
                    let last: u32 = b.trim().parse().map_err(|_| invalid(part))?;
                    if last < start {
                        return Err(invalid(part));
                    }
                    let end = last.checked_add(1).ok_or_else(|| invalid(part))?;
                    rs.add_range(Range::new(start, end));
                }
                None => {
                    let n: u32 = part.parse().map_err(|_| invalid(part))?;
                    rs.add(n).map_err(|_| invalid(part))?;
                }
            }
        }
        Ok(rs)
    }
}

impl Serialize for RangeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RangeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Record of one artifact hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// When the record was first created.
    pub timestamp: DateTime<Utc>,
    /// The build that produced the artifact, if it was produced by a tracked build.
    pub original: Option<BuildPtr>,
    /// Lower-case hex md5 of the artifact content.
    pub md5sum: String,
    /// File name the artifact was first seen under.
    pub file_name: String,
    /// Job name → builds of that job that used the artifact.
    pub usages: BTreeMap<String, RangeSet>,
}

impl Fingerprint {
    pub fn new(original: Option<BuildPtr>, file_name: impl Into<String>, md5sum: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            original,
            md5sum: md5sum.into().to_ascii_lowercase(),
            file_name: file_name.into(),
            usages: BTreeMap::new(),
        }
    }

    /// Records that the given build used this artifact.
    pub fn add_for(&mut self, job: &str, number: u32) -> Result<()> {
        self.usages.entry(job.to_string()).or_default().add(number)
    }

    /// Builds of `job` that used this artifact. Empty if none.
    pub fn range_set(&self, job: &str) -> RangeSet {
        self.usages.get(job).cloned().unwrap_or_default()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &str> {
        self.usages.keys().map(String::as_str)
    }

    /// Equality ignoring the creation timestamp.
    pub fn same_record(&self, other: &Fingerprint) -> bool {
        self.original == other.original
            && self.md5sum == other.md5sum
            && self.file_name == other.file_name
            && self.usages == other.usages
    }
}

/// Sink that publishers use to record artifact usage.
#[async_trait]
pub trait FingerprintRecorder: Send + Sync {
    /// Get-or-create the record for `md5sum` (setting `producer` as the original
    /// only on creation) and append `user` to its usages.
    async fn record(
        &self,
        md5sum: &str,
        file_name: &str,
        producer: Option<BuildPtr>,
        user: &BuildPtr,
    ) -> Result<Fingerprint>;
}
