//! Weak-table traversal and the post-mark clearing passes.
//!
//! Weakness is declared by a `__mode` string on the metatable: `'k'` and/or
//! `'v'`. Weak-value tables park on `weak`, ephemerons (weak keys, strong
//! values) on `ephemeron`, fully weak tables on `allweak`; all three are
//! resolved in the atomic phase.

use super::{GcState, Heap};
use crate::object::{GcRef, Object, TableKey};
use crate::value::Value;

impl Heap {
    /// Weakness of a table: `(weak_keys, weak_values)`.
    pub(crate) fn table_weakness(&self, t: GcRef) -> (bool, bool) {
        let mt = match self.object(t) {
            Object::Table(table) => table.metatable,
            _ => unreachable!("weakness of a non-table"),
        };
        let Some(mt) = mt else {
            return (false, false);
        };
        match self.metafield(mt, self.str_mode) {
            Value::Str(s) => {
                let mode = self.str_text(s).unwrap_or("");
                (mode.contains('k'), mode.contains('v'))
            }
            _ => (false, false),
        }
    }

    // Whether a weak slot holding this value must be cleared. Strings are
    // treated as plain values: marked, never cleared.
    fn is_cleared(&mut self, v: Value) -> bool {
        let Some(r) = v.as_gc_ref() else {
            return false;
        };
        if matches!(self.object(r), Object::Str(_)) {
            self.mark_object(r);
            false
        } else {
            self.header(r).is_white()
        }
    }

    fn is_cleared_key(&mut self, key: TableKey) -> bool {
        let Some(r) = key.as_gc_ref() else {
            return false;
        };
        if matches!(self.object(r), Object::Str(_)) {
            self.mark_object(r);
            false
        } else {
            self.header(r).is_white()
        }
    }

    pub(crate) fn traverse_table(&mut self, r: GcRef) -> usize {
        let mt = match self.object(r) {
            Object::Table(t) => t.metatable,
            _ => unreachable!(),
        };
        if let Some(m) = mt {
            self.mark_object(m);
        }
        match self.table_weakness(r) {
            (false, false) => self.traverse_strong_table(r),
            (false, true) => self.traverse_weak_value(r),
            (true, false) => {
                self.traverse_ephemeron(r);
            }
            (true, true) => self.allweak.push(r),
        }
        super::object_size(self.object(r))
    }

    fn traverse_strong_table(&mut self, r: GcRef) {
        let (array, entries) = match self.object(r) {
            Object::Table(t) => (
                t.array.clone(),
                t.hash.iter().map(|(&k, &v)| (k, v)).collect::<Vec<_>>(),
            ),
            _ => unreachable!(),
        };
        for v in array {
            self.mark_value(v);
        }
        for (k, v) in entries {
            if let Some(kr) = k.as_gc_ref() {
                self.mark_object(kr);
            }
            self.mark_value(v);
        }
    }

    fn traverse_weak_value(&mut self, r: GcRef) {
        let (array_len, entries) = match self.object(r) {
            Object::Table(t) => (
                t.array.len(),
                t.hash.iter().map(|(&k, &v)| (k, v)).collect::<Vec<_>>(),
            ),
            _ => unreachable!(),
        };
        // the array part may always need clearing
        let mut has_clears = array_len > 0;
        for (k, v) in entries {
            if let Some(kr) = k.as_gc_ref() {
                self.mark_object(kr);
            }
            if !has_clears && self.is_cleared(v) {
                has_clears = true;
            }
        }
        if self.state == GcState::Propagate {
            // must be re-traversed in the atomic phase
            self.grayagain.push(r);
        } else if has_clears {
            self.weak.push(r);
        }
    }

    /// Traverse an ephemeron table: a value is marked only if its key is
    /// already reachable. Returns whether anything got marked.
    pub(crate) fn traverse_ephemeron(&mut self, r: GcRef) -> bool {
        let (array, entries) = match self.object(r) {
            Object::Table(t) => (
                t.array.clone(),
                t.hash.iter().map(|(&k, &v)| (k, v)).collect::<Vec<_>>(),
            ),
            _ => unreachable!(),
        };
        let mut marked = false;
        let mut has_clears = false;
        let mut has_white_white = false;

        // integer keys are always reachable, so array values are strong
        for v in array {
            if v.as_gc_ref().is_some_and(|vr| self.header(vr).is_white()) {
                marked = true;
            }
            self.mark_value(v);
        }
        for (k, v) in entries {
            if self.is_cleared_key(k) {
                has_clears = true;
                if self.is_cleared(v) {
                    has_white_white = true;
                }
            } else if self.is_cleared(v) {
                marked = true;
                self.mark_value(v);
            }
        }

        if self.state == GcState::Propagate {
            self.grayagain.push(r);
        } else if has_white_white {
            self.ephemeron.push(r);
        } else if has_clears {
            self.allweak.push(r);
        }
        marked
    }

    /// Iterate ephemeron marking to a fixpoint: each pass may make another
    /// ephemeron's key reachable.
    pub(crate) fn converge_ephemerons(&mut self) -> usize {
        let mut work = 0;
        let mut changed = true;
        while changed {
            changed = false;
            let tables = std::mem::take(&mut self.ephemeron);
            for t in tables {
                if self.traverse_ephemeron(t) {
                    work += self.propagate_all();
                    changed = true;
                }
            }
        }
        work
    }

    /// Clear dead values from weak-value tables registered at or after
    /// `start`.
    pub(crate) fn clear_weak_values(&mut self, start: usize) {
        let tables = self.weak[start.min(self.weak.len())..].to_vec();
        self.clear_values_of(&tables);
    }

    /// Clear dead values from fully weak tables registered at or after
    /// `start`.
    pub(crate) fn clear_allweak_values(&mut self, start: usize) {
        let tables = self.allweak[start.min(self.allweak.len())..].to_vec();
        self.clear_values_of(&tables);
    }

    fn clear_values_of(&mut self, tables: &[GcRef]) {
        for &t in tables {
            let (array, entries) = match self.object(t) {
                Object::Table(tab) => (
                    tab.array.clone(),
                    tab.hash.iter().map(|(&k, &v)| (k, v)).collect::<Vec<_>>(),
                ),
                _ => unreachable!(),
            };
            let mut dead_array: Vec<usize> = Vec::new();
            for (i, v) in array.iter().enumerate() {
                if self.is_cleared(*v) {
                    dead_array.push(i);
                }
            }
            let mut dead_keys: Vec<TableKey> = Vec::new();
            for (k, v) in entries {
                if self.is_cleared(v) {
                    dead_keys.push(k);
                }
            }
            match self.object_mut(t) {
                Object::Table(tab) => {
                    for i in dead_array {
                        tab.array[i] = Value::Nil;
                    }
                    for k in dead_keys {
                        // value side cleared; the emptied entry is purged
                        tab.hash.remove(&k);
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    /// Drop entries with dead keys from ephemeron and fully weak tables.
    pub(crate) fn clear_weak_keys(&mut self) {
        let tables: Vec<GcRef> = self
            .ephemeron
            .iter()
            .chain(self.allweak.iter())
            .copied()
            .collect();
        for t in tables {
            let keys: Vec<TableKey> = match self.object(t) {
                Object::Table(tab) => tab.hash.keys().copied().collect(),
                _ => unreachable!(),
            };
            let mut dead: Vec<TableKey> = Vec::new();
            for k in keys {
                if self.is_cleared_key(k) {
                    dead.push(k);
                }
            }
            match self.object_mut(t) {
                Object::Table(tab) => {
                    for k in dead {
                        tab.hash.remove(&k);
                    }
                }
                _ => unreachable!(),
            }
        }
    }
}
