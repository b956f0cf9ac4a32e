use crate::config::HIDDEN_USER;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// One page entry of a `prop=revisions` response. Revisions stay as raw JSON
/// so a single bad record can be rejected without losing the rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageRevisions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pageid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub revisions: Vec<Value>,
}

/// Typed result of fetching one chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkResult {
    pub pages: Vec<PageRevisions>,
    /// Requested IDs the API reported as `badrevids` (deleted or never existed)
    pub missing: Vec<u64>,
}

impl ChunkResult {
    pub fn revision_count(&self) -> usize {
        self.pages.iter().map(|p| p.revisions.len()).sum()
    }

    /// Resolves every revision record, pairing it with its page's namespace.
    pub fn records(&self) -> impl Iterator<Item = Result<RevisionRecord, MalformedRecord>> + '_ {
        self.pages.iter().flat_map(|page| {
            page.revisions
                .iter()
                .map(move |raw| RevisionRecord::from_raw(raw, page.ns))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Author {
    User(String),
    /// The source suppressed the author's identity
    Hidden,
}

impl Author {
    pub fn key(&self) -> &str {
        match self {
            Author::User(name) => name,
            Author::Hidden => HIDDEN_USER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionRecord {
    pub revid: u64,
    pub author: Author,
    pub namespace: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRecord {
    #[error("revision record is not a valid object: {0}")]
    Invalid(String),
    #[error("revision {revid} has neither a user nor a hidden-user flag")]
    MissingUser { revid: u64 },
    #[error("revision {revid} belongs to a page without a namespace")]
    MissingNamespace { revid: u64 },
}

#[derive(Deserialize)]
struct RawRevision {
    revid: u64,
    #[serde(default)]
    user: Option<String>,
    /// `true` in formatversion 2, `""` in formatversion 1
    #[serde(default)]
    userhidden: Option<Value>,
}

impl RevisionRecord {
    pub fn from_raw(raw: &Value, namespace: Option<i32>) -> Result<Self, MalformedRecord> {
        let rev = RawRevision::deserialize(raw).map_err(|e| MalformedRecord::Invalid(e.to_string()))?;

        let author = match (rev.user, rev.userhidden) {
            (Some(user), _) => Author::User(user),
            (None, Some(_)) => Author::Hidden,
            (None, None) => return Err(MalformedRecord::MissingUser { revid: rev.revid }),
        };
        let namespace = namespace.ok_or(MalformedRecord::MissingNamespace { revid: rev.revid })?;

        Ok(Self {
            revid: rev.revid,
            author,
            namespace,
        })
    }
}

/// Edits by one user. `total` always equals the sum of `per_namespace`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditCount {
    pub total: u64,
    pub per_namespace: BTreeMap<i32, u64>,
}

impl EditCount {
    pub fn record(&mut self, namespace: i32) {
        self.total += 1;
        *self.per_namespace.entry(namespace).or_insert(0) += 1;
    }

    pub fn absorb(&mut self, other: EditCount) {
        self.total += other.total;
        for (namespace, count) in other.per_namespace {
            *self.per_namespace.entry(namespace).or_insert(0) += count;
        }
    }

    pub fn namespace(&self, namespace: i32) -> u64 {
        self.per_namespace.get(&namespace).copied().unwrap_or(0)
    }

    pub fn is_consistent(&self) -> bool {
        self.total == self.per_namespace.values().sum::<u64>()
    }
}

/// Username to edit counts. Ordered so that serialized tables are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditTable {
    users: BTreeMap<String, EditCount>,
}

impl EditTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `count` to `user`'s entry, creating it when absent.
    pub fn add(&mut self, user: String, count: EditCount) {
        match self.users.get_mut(&user) {
            Some(existing) => existing.absorb(count),
            None => {
                self.users.insert(user, count);
            }
        }
    }

    pub fn get(&self, user: &str) -> Option<&EditCount> {
        self.users.get(user)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EditCount)> {
        self.users.iter()
    }

    pub fn total_edits(&self) -> u64 {
        self.users.values().map(|c| c.total).sum()
    }

    pub fn is_consistent(&self) -> bool {
        self.users.values().all(EditCount::is_consistent)
    }
}

impl IntoIterator for EditTable {
    type Item = (String, EditCount);
    type IntoIter = std::collections::btree_map::IntoIter<String, EditCount>;

    fn into_iter(self) -> Self::IntoIter {
        self.users.into_iter()
    }
}

impl FromIterator<(String, EditCount)> for EditTable {
    fn from_iter<I: IntoIterator<Item = (String, EditCount)>>(iter: I) -> Self {
        let mut table = EditTable::new();
        for (user, count) in iter {
            table.add(user, count);
        }
        table
    }
}
