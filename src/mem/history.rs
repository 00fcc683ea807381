//! History queries answered from the changed-path lists of a
//! [`super::MemRepository`].
//!
//! A node's history is walked backwards: the newest change to its path, or
//! the add of an ancestor, tells where it came from. An add with copy-from
//! continues at the copy source; an add without one ends the walk.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::locks::relative;
use super::{Revision, no_such_revision, server_error};
use crate::deltagen::generate;
use crate::types::parse_svn_date;
use crate::{
    DELTA_WINDOW_MAX, FileRevision, Location, NodeKind, PropChange, PropertyList, SvnError,
};

const ERR_NOT_FOUND: u64 = 160013;
const ERR_NOT_FILE: u64 = 160017;

/// How the node at a path reached the revision a change was found in.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Modified,
    Created,
    Copied { path: String, rev: u64 },
}

fn under(prefix: &str, rest: &str) -> String {
    match (prefix, rest) {
        (_, "") => prefix.to_string(),
        ("/", _) => format!("/{rest}"),
        _ => format!("{prefix}/{rest}"),
    }
}

/// Newest revision at or below `rev` that changed the node at `path`, with
/// what happened there. The deepest matching change of a revision wins, so
/// a file replaced inside a copied directory counts as created.
fn last_change(revisions: &[Arc<Revision>], path: &str, rev: u64) -> Option<(u64, Step)> {
    for k in (1..=rev).rev() {
        let revision = revisions.get(k as usize)?;
        let found = revision
            .changes
            .iter()
            .filter_map(|change| Some((change, relative(&change.path, path)?)))
            .filter(|(change, rest)| match change.action.as_str() {
                "A" | "R" => true,
                "M" => rest.is_empty(),
                _ => false,
            })
            .max_by_key(|(change, _)| change.path.len());
        let Some((change, rest)) = found else {
            continue;
        };
        let step = match (change.action.as_str(), &change.copy_from_path, change.copy_from_rev) {
            ("M", _, _) => Step::Modified,
            (_, Some(from), Some(from_rev)) => Step::Copied {
                path: under(from, rest),
                rev: from_rev,
            },
            _ => Step::Created,
        };
        return Some((k, step));
    }
    None
}

/// Revision in which the node at `path` in `rev` came into being there,
/// and where it was copied from.
fn appearance(revisions: &[Arc<Revision>], path: &str, rev: u64) -> (u64, Option<(String, u64)>) {
    let mut rev = rev;
    loop {
        match last_change(revisions, path, rev) {
            None => return (0, None),
            Some((k, Step::Modified)) => rev = k - 1,
            Some((k, Step::Created)) => return (k, None),
            Some((k, Step::Copied { path, rev })) => return (k, Some((path, rev))),
        }
    }
}

fn kind_at(revisions: &[Arc<Revision>], path: &str, rev: u64) -> Result<NodeKind, SvnError> {
    let revision = revisions
        .get(rev as usize)
        .ok_or_else(|| no_such_revision(rev))?;
    Ok(revision.tree.kind_at(path.trim_start_matches('/')))
}

/// Youngest revision whose `svn:date` is at or before `date`.
pub(crate) fn dated_revision(revisions: &[Arc<Revision>], date: DateTime<Utc>) -> u64 {
    revisions
        .iter()
        .enumerate()
        .rev()
        .find(|(_, revision)| {
            revision
                .date()
                .and_then(|text| parse_svn_date(&text))
                .is_some_and(|committed| committed <= date)
        })
        .map_or(0, |(rev, _)| rev as u64)
}

/// Paths of the node at `path` in `peg_rev` in each of `revs`, newest
/// first. Revisions after `peg_rev`, and those in which the node did not
/// exist, are left out.
pub(crate) fn locations(
    revisions: &[Arc<Revision>],
    path: &str,
    peg_rev: u64,
    revs: &[u64],
) -> Result<Vec<Location>, SvnError> {
    if kind_at(revisions, path, peg_rev)? == NodeKind::None {
        return Err(server_error(
            ERR_NOT_FOUND,
            format!("Path '{path}' doesn't exist in revision {peg_rev}"),
        ));
    }
    let mut wanted: Vec<u64> = revs.iter().copied().filter(|r| *r <= peg_rev).collect();
    wanted.sort_unstable_by(|a, b| b.cmp(a));
    wanted.dedup();
    let mut wanted = wanted.into_iter().peekable();

    let mut out = Vec::new();
    let mut path = path.to_string();
    let mut rev = peg_rev;
    loop {
        let (appeared, source) = appearance(revisions, &path, rev);
        while let Some(r) = wanted.next_if(|r| *r >= appeared) {
            out.push(Location {
                rev: r,
                path: path.clone(),
            });
        }
        let Some((from, from_rev)) = source else {
            break;
        };
        // Between the copy source and the copy the node lived nowhere.
        while wanted.next_if(|r| *r > from_rev).is_some() {}
        path = from;
        rev = from_rev;
    }
    Ok(out)
}

fn prop_changes(before: &PropertyList, after: &PropertyList) -> Vec<PropChange> {
    let mut changes: Vec<PropChange> = after
        .iter()
        .filter(|(name, value)| before.get(*name) != Some(*value))
        .map(|(name, value)| PropChange {
            name: name.clone(),
            value: Some(value.clone()),
        })
        .collect();
    changes.extend(
        before
            .keys()
            .filter(|name| !after.contains_key(*name))
            .map(|name| PropChange {
                name: name.clone(),
                value: None,
            }),
    );
    changes
}

/// Changes to file `path` from the last one at or before `start` through
/// `end`, oldest first, each as a delta against the one before.
pub(crate) fn file_revisions(
    revisions: &[Arc<Revision>],
    path: &str,
    start: u64,
    end: u64,
) -> Result<Vec<FileRevision>, SvnError> {
    let (start, end) = (start.min(end), start.max(end));
    match kind_at(revisions, path, end)? {
        NodeKind::File => {}
        NodeKind::None => {
            return Err(server_error(
                ERR_NOT_FOUND,
                format!("Path '{path}' doesn't exist in revision {end}"),
            ));
        }
        NodeKind::Dir => {
            return Err(server_error(ERR_NOT_FILE, format!("'{path}' is not a file")));
        }
    }

    let mut history = Vec::new();
    let mut path = path.to_string();
    let mut rev = end;
    while let Some((k, step)) = last_change(revisions, &path, rev) {
        history.push((k, path.clone()));
        if k <= start {
            break;
        }
        match step {
            Step::Modified => rev = k - 1,
            Step::Created => break,
            Step::Copied { path: from, rev: from_rev } => {
                path = from;
                rev = from_rev;
            }
        }
    }

    let mut contents: Arc<Vec<u8>> = Arc::default();
    let mut props = PropertyList::new();
    let mut out = Vec::with_capacity(history.len());
    for (rev, path) in history.into_iter().rev() {
        let revision = &revisions[rev as usize];
        let node = revision
            .tree
            .lookup(path.trim_start_matches('/'))
            .map(|id| revision.tree.node(id))
            .ok_or_else(|| SvnError::conflict(&path, format!("missing from r{rev}")))?;
        out.push(FileRevision {
            path,
            rev,
            rev_props: revision.props.clone(),
            prop_changes: prop_changes(&props, &node.props),
            merged: false,
            windows: generate(&contents, &node.contents, DELTA_WINDOW_MAX),
        });
        contents = Arc::clone(&node.contents);
        props = node.props.clone();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::ChangedPath;
    use crate::mem::tree::Tree;

    fn change(action: &str, path: &str, copy: Option<(&str, u64)>) -> ChangedPath {
        ChangedPath {
            action: action.to_string(),
            path: path.to_string(),
            copy_from_path: copy.map(|(p, _)| p.to_string()),
            copy_from_rev: copy.map(|(_, r)| r),
            node_kind: None,
        }
    }

    fn history(changes: Vec<Vec<ChangedPath>>) -> Vec<Arc<Revision>> {
        std::iter::once(Vec::new())
            .chain(changes)
            .map(|changes| {
                Arc::new(Revision {
                    tree: Arc::new(Tree::new()),
                    props: PropertyList::new(),
                    changes,
                })
            })
            .collect()
    }

    #[test]
    fn copies_continue_the_walk_and_plain_adds_end_it() {
        let revisions = history(vec![
            vec![change("A", "/a", None), change("A", "/a/f", None)],
            vec![change("M", "/a/f", None)],
            vec![change("A", "/b", Some(("/a", 2)))],
            vec![change("M", "/b/f", None)],
            vec![change("R", "/b/f", None)],
        ]);

        assert_eq!(last_change(&revisions, "/b/f", 4), Some((4, Step::Modified)));
        assert_eq!(
            last_change(&revisions, "/b/f", 3),
            Some((
                3,
                Step::Copied {
                    path: "/a/f".into(),
                    rev: 2
                }
            ))
        );
        assert_eq!(last_change(&revisions, "/b/f", 5), Some((5, Step::Created)));
        assert_eq!(appearance(&revisions, "/a/f", 2), (1, None));
        assert_eq!(
            appearance(&revisions, "/b/f", 4),
            (3, Some(("/a/f".into(), 2)))
        );
        assert_eq!(appearance(&revisions, "/", 5), (0, None));
    }

    #[test]
    fn prop_changes_list_sets_then_deletes() {
        let before = PropertyList::from([
            ("a".to_string(), b"1".to_vec()),
            ("b".to_string(), b"2".to_vec()),
        ]);
        let after = PropertyList::from([
            ("a".to_string(), b"1".to_vec()),
            ("c".to_string(), b"3".to_vec()),
        ]);
        assert_eq!(
            prop_changes(&before, &after),
            vec![
                PropChange {
                    name: "c".into(),
                    value: Some(b"3".to_vec()),
                },
                PropChange {
                    name: "b".into(),
                    value: None,
                },
            ]
        );
    }

    #[test]
    fn undated_revisions_are_skipped() {
        let revisions = history(vec![Vec::new()]);
        let date = parse_svn_date("2025-01-01T00:00:00Z").unwrap();
        assert_eq!(dated_revision(&revisions, date), 0);
    }
}
