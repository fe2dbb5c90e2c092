//! Candidate identifiers and the deployment pre-filter applied to a server listing.
//!
//! Identifiers have the form `<stem>_<category>_<age>.<ext>`, for example
//! `0140012345_F_34.jpg`. The category code and the age are the last two
//! underscore-separated fields of the file stem; the stem itself may contain
//! further underscores.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

/// Ordered, immutable list of candidate identifiers handed to the matcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CandidateList(Vec<String>);

impl CandidateList {
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl FromIterator<String> for CandidateList {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Fields embedded in a well-formed candidate identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFields<'a> {
    pub stem: &'a str,
    pub category: &'a str,
    pub age: u32,
}

/// Split `<stem>_<category>_<age>[.<ext>]` into its fields.
///
/// Returns `None` when the stem, category or age is missing or the age is not
/// all ASCII digits.
pub fn parse_candidate_id(id: &str) -> Option<CandidateFields<'_>> {
    let base = match id.rsplit_once('.') {
        Some((base, _ext)) => base,
        None => id,
    };

    let (rest, age) = base.rsplit_once('_')?;
    let (stem, category) = rest.rsplit_once('_')?;
    if stem.is_empty() || category.is_empty() {
        return None;
    }
    if age.is_empty() || !age.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    Some(CandidateFields {
        stem,
        category,
        age: age.parse().ok()?,
    })
}

/// Pre-filter keeping only candidates whose embedded fields match every
/// configured dimension. With nothing configured, everything is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateFilter {
    pub categories: Option<Vec<String>>,
    pub age_window: Option<RangeInclusive<u32>>,
}

impl CandidateFilter {
    pub fn is_empty(&self) -> bool {
        self.categories.is_none() && self.age_window.is_none()
    }

    pub fn accepts(&self, id: &str) -> bool {
        if self.is_empty() {
            return true;
        }
        let Some(fields) = parse_candidate_id(id) else {
            return false;
        };

        if let Some(categories) = &self.categories {
            if !categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(fields.category))
            {
                return false;
            }
        }
        if let Some(window) = &self.age_window {
            if !window.contains(&fields.age) {
                return false;
            }
        }
        true
    }

    /// Filter a server listing, preserving order.
    pub fn apply<I>(&self, ids: I) -> CandidateList
    where
        I: IntoIterator<Item = String>,
    {
        ids.into_iter().filter(|id| self.accepts(id)).collect()
    }
}
