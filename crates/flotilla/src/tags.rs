// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tag codec.
//!
//! Labels and tag values end up in instance tags and inside blob key paths
//! (`{date}_{k=v,k=v}/nohup.out`), so the separators used there (`,` `_` `/`)
//! and spaces are replaced with `-`.

use std::collections::BTreeMap;
use std::fmt;

use tracing::info;

use crate::error::{Error, Result};

/// Tag key holding the launch id.
pub const LAUNCH_KEY: &str = "launch";
/// Tag key holding the per-item label.
pub const LABEL_KEY: &str = "label";
/// Tag key holding the instance name.
pub const NAME_KEY: &str = "Name";

const REPLACED: [char; 4] = [',', ' ', '_', '/'];

/// Make a label safe for use as a tag value and inside a log key path.
pub fn tagify(old: &str) -> String {
    let new = encode(old);
    if new != old {
        info!(old = %old, new = %new, "Tagified label");
    }
    new
}

fn encode(s: &str) -> String {
    s.chars()
        .map(|c| if REPLACED.contains(&c) { '-' } else { c })
        .collect()
}

/// Split a `key=value` tag on the first `=`.
pub fn parse_tag(s: &str) -> Result<(String, String)> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| Error::MalformedTag(s.to_string()))
}

/// An ordered set of `key=value` tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    /// Create an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every entry with [`parse_tag`].
    pub fn parse<I, S>(tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        for tag in tags {
            let (k, v) = parse_tag(tag.as_ref())?;
            set.insert(k, v);
        }
        Ok(set)
    }

    /// Decode a comma-joined tag string, skipping entries without `=`.
    pub fn decode(joined: &str) -> Self {
        Self(
            joined
                .split(',')
                .filter_map(|t| parse_tag(t).ok())
                .collect(),
        )
    }

    /// Insert or replace a tag.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style [`TagSet::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a tag value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The `launch` tag, if present.
    pub fn launch_id(&self) -> Option<&str> {
        self.get(LAUNCH_KEY)
    }

    /// The `label` tag, if present.
    pub fn label(&self) -> Option<&str> {
        self.get(LABEL_KEY)
    }

    /// Iterate over `(key, value)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every tag of `self` is present with the same value in `other`.
    pub fn matches(&self, other: &TagSet) -> bool {
        self.iter().all(|(k, v)| other.get(k) == Some(v))
    }

    /// Tag set with keys and values encoded the way they appear in key paths.
    pub fn encoded(&self) -> Self {
        Self(self.iter().map(|(k, v)| (encode(k), encode(v))).collect())
    }

    /// Comma-joined, path-safe form used in log directory names.
    pub fn encode_path_segment(&self) -> String {
        self.encoded().to_string()
    }

    /// Tags as `key=value` strings.
    pub fn to_strings(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for TagSet {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<(String, String)> for TagSet {
    fn extend<T: IntoIterator<Item = (String, String)>>(&mut self, iter: T) {
        self.0.extend(iter);
    }
}
