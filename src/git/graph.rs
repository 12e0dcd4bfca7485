//! Commit graph walks: ahead/behind counts, merge bases and ancestry.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::debug;

use super::object_id::ObjectId;
use super::odb::ObjectStore;
use crate::error::Result;

const FROM_LOCAL: u8 = 0b01;
const FROM_REMOTE: u8 = 0b10;
const FROM_BOTH: u8 = FROM_LOCAL | FROM_REMOTE;

/// Commits reachable from only one of two tips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AheadBehind {
    /// Reachable from the local tip only.
    pub ahead: usize,
    /// Reachable from the remote tip only.
    pub behind: usize,
}

/// Origin marks for every commit reachable from either tip.
///
/// A commit is re-queued only when its mark set grows, so each commit is
/// expanded at most twice.
fn mark_reachable(
    store: &ObjectStore,
    local: ObjectId,
    remote: ObjectId,
) -> Result<HashMap<ObjectId, u8>> {
    let mut marks: HashMap<ObjectId, u8> = HashMap::new();
    let mut queue: VecDeque<ObjectId> = VecDeque::new();

    for (id, mark) in [(local, FROM_LOCAL), (remote, FROM_REMOTE)] {
        *marks.entry(id).or_default() |= mark;
        queue.push_back(id);
    }

    while let Some(id) = queue.pop_front() {
        let mark = marks.get(&id).copied().unwrap_or_default();
        let commit = store.read_commit(&id)?;
        for parent in &commit.parents {
            let current = marks.entry(*parent).or_default();
            if *current | mark != *current {
                *current |= mark;
                queue.push_back(*parent);
            }
        }
    }
    Ok(marks)
}

/// Counts commits reachable only from `local` (ahead) and only from
/// `remote` (behind). Both ids are peeled through annotated tags.
pub fn ahead_behind(store: &ObjectStore, local: &ObjectId, remote: &ObjectId) -> Result<AheadBehind> {
    let local = peel(store, local)?;
    let remote = peel(store, remote)?;
    if local == remote {
        return Ok(AheadBehind::default());
    }

    let marks = mark_reachable(store, local, remote)?;
    let mut counts = AheadBehind::default();
    for mark in marks.values() {
        match *mark {
            FROM_LOCAL => counts.ahead += 1,
            FROM_REMOTE => counts.behind += 1,
            _ => {}
        }
    }
    debug!(visited = marks.len(), ahead = counts.ahead, behind = counts.behind, "ahead/behind walk");
    Ok(counts)
}

/// Best common ancestor of `a` and `b`: a commit reachable from both that
/// is not an ancestor of another such commit. Ties resolve to the newest
/// committer date, then the smallest id.
pub fn merge_base(store: &ObjectStore, a: &ObjectId, b: &ObjectId) -> Result<Option<ObjectId>> {
    let a = peel(store, a)?;
    let b = peel(store, b)?;
    if a == b {
        return Ok(Some(a));
    }

    let marks = mark_reachable(store, a, b)?;
    let common: HashSet<ObjectId> = marks
        .iter()
        .filter(|(_, mark)| **mark == FROM_BOTH)
        .map(|(id, _)| *id)
        .collect();

    // Drop every common commit that is a proper ancestor of another one.
    let mut dominated: HashSet<ObjectId> = HashSet::new();
    let mut stack: Vec<ObjectId> = Vec::new();
    for id in &common {
        if dominated.contains(id) {
            continue;
        }
        stack.extend(store.read_commit(id)?.parents.iter().copied());
        while let Some(next) = stack.pop() {
            if !dominated.insert(next) {
                continue;
            }
            let commit = store.read_commit(&next)?;
            stack.extend(commit.parents.iter().copied());
        }
    }

    let mut best: Option<(i64, ObjectId)> = None;
    for id in common.difference(&dominated) {
        let when = store
            .read_commit(id)?
            .committer
            .as_ref()
            .map_or(0, |sig| sig.when.timestamp());
        let better = match best {
            None => true,
            Some((best_when, best_id)) => when > best_when || (when == best_when && *id < best_id),
        };
        if better {
            best = Some((when, *id));
        }
    }
    Ok(best.map(|(_, id)| id))
}

/// True if `ancestor` is reachable from `descendant` (a commit counts as
/// its own descendant).
pub fn is_descendant_of(store: &ObjectStore, descendant: &ObjectId, ancestor: &ObjectId) -> Result<bool> {
    let descendant = peel(store, descendant)?;
    let ancestor = peel(store, ancestor)?;

    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut queue = VecDeque::from([descendant]);
    while let Some(id) = queue.pop_front() {
        if id == ancestor {
            return Ok(true);
        }
        if !seen.insert(id) {
            continue;
        }
        let commit = store.read_commit(&id)?;
        queue.extend(commit.parents.iter().filter(|p| !seen.contains(*p)).copied());
    }
    Ok(false)
}

fn peel(store: &ObjectStore, id: &ObjectId) -> Result<ObjectId> {
    store.peel_to_commit(id).map(|commit| commit.id)
}
