// 🗂️ Candidate Indexer - last name → unlinked ratings identities
//
// Rebuilt at the start of every pass: earlier passes and merges change which
// ratings identities are still unlinked.

use crate::db::IdentityRecord;
use crate::names::{initial_matches, name_key, parse_ratings_name, ParsedName};
use std::collections::HashMap;

/// An unlinked ratings identity with its name pre-parsed
#[derive(Debug, Clone)]
pub struct IndexedCandidate {
    pub record: IdentityRecord,
    pub name: ParsedName,
}

#[derive(Debug, Default)]
pub struct CandidateIndex {
    by_last: HashMap<String, Vec<IndexedCandidate>>,
    len: usize,
}

impl CandidateIndex {
    /// O(n) build. Records without a usable ratings name are left out.
    pub fn build(unlinked: &[IdentityRecord]) -> Self {
        let mut index = CandidateIndex::default();

        for record in unlinked {
            let Some(raw) = record.name_ratings.as_deref() else {
                continue;
            };
            let name = parse_ratings_name(raw);
            let key = name.last_key();
            if key.is_empty() {
                continue;
            }

            index.by_last.entry(key).or_default().push(IndexedCandidate {
                record: record.clone(),
                name,
            });
            index.len += 1;
        }

        index
    }

    /// Every candidate sharing the last name, in insertion order
    pub fn lookup(&self, last: &str) -> &[IndexedCandidate] {
        self.by_last
            .get(&name_key(last))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Candidates whose last name equals the roster last name and whose first
    /// name starts with the roster initial
    pub fn initial_candidates(&self, roster: &ParsedName) -> Vec<&IndexedCandidate> {
        self.lookup(&roster.last)
            .iter()
            .filter(|candidate| initial_matches(&roster.first, &candidate.name.first))
            .collect()
    }

    /// Drop a claimed candidate so nothing else in the pass can take it
    pub fn remove(&mut self, identity_id: i64) -> bool {
        for candidates in self.by_last.values_mut() {
            if let Some(pos) = candidates.iter().position(|c| c.record.id == identity_id) {
                candidates.remove(pos);
                self.len -= 1;
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
