//! Directory entries and their ordering.
//!
//! Entries are kept in a single `Vec<DirEntry>`, sorted `(name length DESC,
//! name ASC)`, serialized as one `bincode` blob and stored via the chained
//! block writer in `chain.rs`. A real balanced tree is not implemented:
//! the ordering invariant that matters for correctness (longest names
//! first, so recursive delete never needs the parent to grow while
//! shrinking) is just as easily maintained by keeping one sorted vector
//! and re-serializing it on every mutation. See DESIGN.md for the tradeoff.
use failure::Error;
use serde_derive::{Deserialize, Serialize};

use crate::id::ObjId;

use super::head::ObjType;

/// Whether directory lookups treat `"A"` and `"a"` as the same name.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CaseSensitivity {
    Exact,
    Insensitive,
}

impl CaseSensitivity {
    fn fold<'a>(self, name: &'a str) -> std::borrow::Cow<'a, str> {
        match self {
            CaseSensitivity::Exact => std::borrow::Cow::Borrowed(name),
            CaseSensitivity::Insensitive => std::borrow::Cow::Owned(name.to_lowercase()),
        }
    }

    pub(crate) fn matches(self, a: &str, b: &str) -> bool {
        self.fold(a) == self.fold(b)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub(crate) struct DirEntry {
    pub name: String,
    pub id: ObjId,
    pub obj_type: ObjType,
}

/// Comparator implementing `(name length DESC, name ASC)`, the order
/// recursive delete depends on.
fn order_key(name: &str) -> (std::cmp::Reverse<usize>, &str) {
    (std::cmp::Reverse(name.len()), name)
}

pub(crate) fn sort(entries: &mut Vec<DirEntry>) {
    entries.sort_by(|a, b| order_key(&a.name).cmp(&order_key(&b.name)));
}

pub(crate) fn find<'a>(entries: &'a [DirEntry], name: &str, case: CaseSensitivity) -> Option<(usize, &'a DirEntry)> {
    entries.iter().enumerate().find(|(_, e)| case.matches(&e.name, name))
}

pub(crate) fn insert(entries: &mut Vec<DirEntry>, entry: DirEntry) {
    entries.push(entry);
    sort(entries);
}

pub(crate) fn remove(entries: &mut Vec<DirEntry>, idx: usize) -> DirEntry {
    entries.remove(idx)
}

pub(crate) fn encode(entries: &[DirEntry]) -> Result<Vec<u8>, Error> {
    Ok(bincode::serialize(entries)?)
}

pub(crate) fn decode(raw: &[u8]) -> Result<Vec<DirEntry>, Error> {
    Ok(bincode::deserialize(raw)?)
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(name: &str) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            id: ObjId::root(),
            obj_type: ObjType::File,
        }
    }

    #[test]
    fn sorts_longest_name_first_then_alphabetically() {
        let mut entries = vec![entry("b"), entry("aa"), entry("a"), entry("ab")];
        sort(&mut entries);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["aa", "ab", "a", "b"]);
    }

    #[test]
    fn insensitive_find_matches_different_case() {
        let entries = vec![entry("Foo")];
        assert!(find(&entries, "foo", CaseSensitivity::Insensitive).is_some());
        assert!(find(&entries, "foo", CaseSensitivity::Exact).is_none());
    }

    #[test]
    fn round_trips_through_bincode() {
        let mut entries = vec![entry("one"), entry("two")];
        sort(&mut entries);
        let raw = encode(&entries).unwrap();
        let back = decode(&raw).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].name, entries[0].name);
    }
}
