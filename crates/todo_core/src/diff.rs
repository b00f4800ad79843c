//! Keyed list diffing.
//!
//! Items are matched by a stable key, never by position, so an item whose
//! contents change in place is reported as an update rather than a
//! remove/insert pair. Surviving items that keep their relative order form a
//! longest increasing subsequence; only items outside it are reported as moves.

use std::{
    collections::{HashMap, HashSet},
    hash::Hash,
};

pub trait Keyed {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;
}

/// Batch edit turning one ordered list into another.
///
/// Indices follow the usual batch-update convention: `removed` and the
/// source of each move refer to the old list, `inserted` and the destination
/// of each move refer to the new list. `updated` names old indices whose
/// item survives with different contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditScript {
    pub removed: Vec<usize>,
    pub inserted: Vec<usize>,
    pub moved: Vec<(usize, usize)>,
    pub updated: Vec<usize>,
}

impl EditScript {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.inserted.is_empty()
            && self.moved.is_empty()
            && self.updated.is_empty()
    }

    pub fn len(&self) -> usize {
        self.removed.len() + self.inserted.len() + self.moved.len() + self.updated.len()
    }

    /// Replays the script over `old`, taking inserted and updated contents
    /// from `new`. Returns `None` when the script does not fit the inputs.
    pub fn apply<T: Clone>(&self, old: &[T], new: &[T]) -> Option<Vec<T>> {
        let len = (old.len() + self.inserted.len()).checked_sub(self.removed.len())?;
        if len != new.len() {
            return None;
        }

        let removed: HashSet<usize> = self.removed.iter().copied().collect();
        let updated: HashSet<usize> = self.updated.iter().copied().collect();
        let moved: HashMap<usize, usize> = self.moved.iter().copied().collect();
        if removed.iter().chain(&updated).chain(moved.keys()).any(|&o| o >= old.len()) {
            return None;
        }

        let pick = |from: usize, to: usize| {
            if updated.contains(&from) {
                new[to].clone()
            } else {
                old[from].clone()
            }
        };

        let mut slots: Vec<Option<T>> = (0..len).map(|_| None).collect();
        for &to in &self.inserted {
            place(&mut slots, to, new.get(to)?.clone())?;
        }
        for (&from, &to) in &moved {
            if to >= len {
                return None;
            }
            place(&mut slots, to, pick(from, to))?;
        }

        let mut free = (0..len).filter(|&i| slots[i].is_none()).collect::<Vec<_>>().into_iter();
        for from in 0..old.len() {
            if removed.contains(&from) || moved.contains_key(&from) {
                continue;
            }
            let to = free.next()?;
            slots[to] = Some(pick(from, to));
        }

        slots.into_iter().collect()
    }
}

fn place<T>(slots: &mut [Option<T>], index: usize, item: T) -> Option<()> {
    let slot = slots.get_mut(index)?;
    if slot.is_some() {
        return None;
    }
    *slot = Some(item);
    Some(())
}

/// Computes the edit script from `old` to `new`. Keys are expected to be
/// unique within each list; a repeated key in `new` is treated as an insert.
pub fn diff<T>(old: &[T], new: &[T]) -> EditScript
where
    T: Keyed + PartialEq,
{
    let mut old_index: HashMap<T::Key, usize> = HashMap::with_capacity(old.len());
    for (i, item) in old.iter().enumerate() {
        old_index.entry(item.key()).or_insert(i);
    }

    let mut script = EditScript::default();
    let mut matched = vec![false; old.len()];
    // (old index, new index) of every surviving item, in new order.
    let mut survivors = Vec::new();

    for (to, item) in new.iter().enumerate() {
        match old_index.remove(&item.key()) {
            Some(from) => {
                matched[from] = true;
                survivors.push((from, to));
                if old[from] != *item {
                    script.updated.push(from);
                }
            }
            None => script.inserted.push(to),
        }
    }

    script.removed = (0..old.len()).filter(|&i| !matched[i]).collect();
    script.updated.sort_unstable();

    let sources: Vec<usize> = survivors.iter().map(|&(from, _)| from).collect();
    let stationary = longest_increasing(&sources);
    script.moved = survivors
        .iter()
        .enumerate()
        .filter(|(i, _)| !stationary.contains(i))
        .map(|(_, &pair)| pair)
        .collect();

    script
}

/// Positions in `seq` forming one longest strictly increasing subsequence.
fn longest_increasing(seq: &[usize]) -> HashSet<usize> {
    // tails[k] is the position of the smallest tail of an increasing run of length k + 1.
    let mut tails: Vec<usize> = Vec::new();
    let mut previous: Vec<Option<usize>> = vec![None; seq.len()];

    for (i, &value) in seq.iter().enumerate() {
        let k = tails.partition_point(|&t| seq[t] < value);
        if k > 0 {
            previous[i] = Some(tails[k - 1]);
        }
        if k == tails.len() {
            tails.push(i);
        } else {
            tails[k] = i;
        }
    }

    let mut members = HashSet::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(i) = cursor {
        members.insert(i);
        cursor = previous[i];
    }
    members
}

#[cfg(test)]
#[path = "tests/diff_tests.rs"]
mod tests;
