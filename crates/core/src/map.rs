//! Value Maps
//!
//! A hash map from values to values with two properties the language
//! depends on:
//!
//! - iteration in *insertion order*, with stable contiguous indices
//!   `[0, occupancy)`, and
//! - displacement-based placement: each key hashes to two candidate slots
//!   (two independent seeds); inserting into full candidates displaces the
//!   resident to its alternate slot for a bounded number of steps, after
//!   which the table rehashes with fresh seeds (doubling first when load
//!   is high).
//!
//! Cells never move once inserted, so the index returned by `insert_key`
//! stays valid for the life of the map; only the slot table is rebuilt.
//!
//! Reference discipline matches the containers: storing a key or value
//! transfers the reference, fetching does not add one.

use crate::fingerprint::{finger_seed, fingerprint_cat, hash_u64, map_hash_cat};
use crate::heap::{Heap, Relocation};
use crate::tagged::Val;
use crate::val::{self, ValEnv};

const EMPTY: i32 = -1;
const MIN_SLOTS: usize = 8;

pub struct MapCell {
    pub key: Val,
    pub value: Val,
}

pub struct SzlMap {
    slots: Box<[i32]>, // cell indices, EMPTY when free
    cells: Vec<MapCell>,
    seed0: u64,
    seed1: u64,
}

#[inline]
fn bucket(h: u32, seed: u64, mask: usize) -> usize {
    let x = (h as u64 ^ seed).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    (x >> 32) as usize & mask
}

impl SzlMap {
    /// New map with room for about `space` entries before the first grow.
    pub fn new(space: usize) -> SzlMap {
        let slots = (space * 2).next_power_of_two().max(MIN_SLOTS);
        SzlMap {
            slots: vec![EMPTY; slots].into_boxed_slice(),
            cells: Vec::with_capacity(space),
            seed0: 0x5bd1_e995_97f4_a7c1,
            seed1: 0xc2b2_ae3d_27d4_eb4f,
        }
    }

    pub fn occupancy(&self) -> usize {
        self.cells.len()
    }

    fn max_displacements(&self) -> usize {
        8 + 2 * (usize::BITS - self.slots.len().leading_zeros()) as usize
    }

    /// Index of `key`, or -1. A placed key is always at one of its two
    /// candidate slots.
    pub fn lookup(&self, key: Val) -> i32 {
        let mask = self.slots.len() - 1;
        let h = key.hash();
        for seed in [self.seed0, self.seed1] {
            let s = self.slots[bucket(h, seed, mask)];
            if s != EMPTY && self.cells[s as usize].key.is_equal(key) {
                return s;
            }
        }
        EMPTY
    }

    /// Insert `key`, returning its cell index. Idempotent: a key already
    /// present yields the same index and the extra key reference is
    /// released. A new key's reference transfers into the map and its
    /// value starts undefined.
    pub fn insert_key(&mut self, key: Val) -> i32 {
        let found = self.lookup(key);
        if found != EMPTY {
            key.dec_ref();
            return found;
        }
        // Keep the load at or below half: two-choice displacement degrades
        // quickly past that.
        if (self.cells.len() + 1) * 2 > self.slots.len() {
            self.rebuild(true);
        }
        let index = self.cells.len() as i32;
        self.cells.push(MapCell {
            key,
            value: Val::NULL,
        });
        if !self.place(index) {
            self.rebuild(false);
        }
        index
    }

    /// Place a cell index into the slot table, displacing residents along
    /// their alternate slots for a bounded number of steps.
    fn place(&mut self, index: i32) -> bool {
        let mask = self.slots.len() - 1;
        let mut cur = index;
        let mut from = usize::MAX;
        for _ in 0..self.max_displacements() {
            let h = self.cells[cur as usize].key.hash();
            let b0 = bucket(h, self.seed0, mask);
            let b1 = bucket(h, self.seed1, mask);
            if self.slots[b0] == EMPTY {
                self.slots[b0] = cur;
                return true;
            }
            if self.slots[b1] == EMPTY {
                self.slots[b1] = cur;
                return true;
            }
            // Displace; never kick straight back where this cell came from.
            let vb = if b0 != from { b0 } else { b1 };
            let victim = self.slots[vb];
            self.slots[vb] = cur;
            cur = victim;
            from = vb;
        }
        false
    }

    /// Rebuild the slot table with fresh seeds, doubling first when `grow`
    /// is requested or after repeated placement failures.
    fn rebuild(&mut self, mut grow: bool) {
        let mut failures = 0;
        loop {
            let len = if grow {
                self.slots.len() * 2
            } else {
                self.slots.len()
            };
            self.slots = vec![EMPTY; len].into_boxed_slice();
            self.seed0 = rand::random::<u64>() | 1;
            self.seed1 = rand::random::<u64>() | 1;
            let ok = (0..self.cells.len() as i32).all(|i| self.place(i));
            if ok {
                return;
            }
            failures += 1;
            grow = failures >= 2;
            if grow {
                failures = 0;
            }
        }
    }

    /// Value at a cell index (no reference transfer).
    pub fn fetch(&self, index: i32) -> Val {
        self.cells[index as usize].value
    }

    /// Store a value: the old reference is released, the new one
    /// transfers in.
    pub fn set_value(&mut self, index: i32, value: Val) {
        let cell = &mut self.cells[index as usize];
        cell.value.dec_ref();
        cell.value = value;
    }

    /// Store a value without releasing the old one, whose reference the
    /// caller has already consumed (uniq-loading path).
    pub fn set_value_raw(&mut self, index: i32, value: Val) {
        self.cells[index as usize].value = value;
    }

    /// Add `delta` to an integer value in place.
    pub fn inc_value(&mut self, heap: &mut Heap, index: i32, delta: i64) -> Result<(), String> {
        let old = self.fetch(index);
        if old.is_null() {
            return Err("undefined map value".to_string());
        }
        let new = val::new_int(heap, old.as_int().wrapping_add(delta));
        self.set_value(index, new);
        Ok(())
    }

    /// Key of the i-th inserted entry.
    pub fn get_key_by_index(&self, index: i32) -> Val {
        self.cells[index as usize].key
    }

    /// Value of the i-th inserted entry.
    pub fn get_value_by_index(&self, index: i32) -> Val {
        self.cells[index as usize].value
    }

    /// Key-set equality with matching values; insertion order is ignored.
    pub fn equal(&self, other: &SzlMap) -> bool {
        if self.occupancy() != other.occupancy() {
            return false;
        }
        self.cells.iter().all(|cell| {
            let i = other.lookup(cell.key);
            i != EMPTY && other.fetch(i).is_equal(cell.value)
        })
    }

    /// Order-independent hash consistent with `equal`.
    pub fn hash(&self) -> u32 {
        let mut h = hash_u64(self.occupancy() as u64);
        for cell in &self.cells {
            let pair = ((cell.key.hash() as u64) << 32) | cell.value.hash() as u64;
            h = map_hash_cat(h, hash_u64(pair));
        }
        h
    }

    /// Order-independent fingerprint consistent with `equal`: equal maps
    /// built in different insertion orders fingerprint identically.
    pub fn fingerprint(&self, env: &dyn ValEnv) -> u64 {
        let mut fp = finger_seed();
        for cell in &self.cells {
            fp ^= fingerprint_cat(cell.key.fingerprint(env), cell.value.fingerprint(env));
        }
        fp
    }

    /// Deep-copy the table for uniq: every key and value gains a
    /// reference.
    pub fn clone_table(&self) -> Box<SzlMap> {
        for cell in &self.cells {
            cell.key.inc_ref();
            cell.value.inc_ref();
        }
        Box::new(SzlMap {
            slots: self.slots.clone(),
            cells: self
                .cells
                .iter()
                .map(|c| MapCell {
                    key: c.key,
                    value: c.value,
                })
                .collect(),
            seed0: self.seed0,
            seed1: self.seed1,
        })
    }

    /// Release every contained reference (called from the map form's
    /// delete).
    pub fn release_elements(&self, heap: &mut Heap) {
        for cell in &self.cells {
            cell.key.dec_ref_and_check(heap);
            cell.value.dec_ref_and_check(heap);
        }
    }

    /// Rewrite cell pointers after compaction. The table itself is host
    /// memory and never moves.
    pub fn adjust_heap_ptrs(&mut self, reloc: &Relocation) {
        for cell in &mut self.cells {
            reloc.relocate_slot(&mut cell.key);
            reloc.relocate_slot(&mut cell.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::val::{NullEnv, new_int, new_string};

    fn heap() -> Heap {
        Heap::new(4096, 1 << 24)
    }

    #[test]
    fn test_insert_lookup_fetch() {
        let mut h = heap();
        let mut m = SzlMap::new(4);
        let k = new_string(&mut h, "answer");
        k.inc_ref();
        let i = m.insert_key(k);
        m.set_value(i, Val::from_smi(42));
        assert_eq!(m.lookup(k), i);
        assert_eq!(m.fetch(i).as_int(), 42);
        assert_eq!(m.occupancy(), 1);
    }

    #[test]
    fn test_insert_key_idempotent() {
        let mut h = heap();
        let mut m = SzlMap::new(4);
        let k1 = new_string(&mut h, "dup");
        let k2 = new_string(&mut h, "dup");
        let i1 = m.insert_key(k1);
        let i2 = m.insert_key(k2);
        assert_eq!(i1, i2);
        assert_eq!(m.occupancy(), 1);
    }

    #[test]
    fn test_grow_keeps_order_and_indices() {
        let mut h = heap();
        let mut m = SzlMap::new(2);
        const N: i64 = 10_000;
        for x in 0..N {
            let i = m.insert_key(new_int(&mut h, x));
            assert_eq!(i as i64, x, "indices are contiguous insertion order");
            m.set_value(i, Val::from_smi(x * 2));
        }
        assert_eq!(m.occupancy() as i64, N);
        for x in 0..N {
            // Iteration order is insertion order.
            assert_eq!(m.get_key_by_index(x as i32).as_int(), x);
            // Lookup still finds every key at its original index.
            let k = new_int(&mut h, x);
            let i = m.lookup(k);
            assert_eq!(i as i64, x);
            assert_eq!(m.fetch(i).as_int(), x * 2);
        }
    }

    #[test]
    fn test_equal_ignores_insertion_order() {
        let mut h = heap();
        let mut a = SzlMap::new(4);
        let mut b = SzlMap::new(4);
        for &(k, v) in &[(1i64, 10i64), (2, 20), (3, 30)] {
            let i = a.insert_key(new_int(&mut h, k));
            a.set_value(i, Val::from_smi(v));
        }
        for &(k, v) in &[(3i64, 30i64), (1, 10), (2, 20)] {
            let i = b.insert_key(new_int(&mut h, k));
            b.set_value(i, Val::from_smi(v));
        }
        assert!(a.equal(&b));
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.fingerprint(&NullEnv), b.fingerprint(&NullEnv));
    }

    #[test]
    fn test_unequal_values() {
        let mut h = heap();
        let mut a = SzlMap::new(4);
        let mut b = SzlMap::new(4);
        let i = a.insert_key(new_int(&mut h, 1));
        a.set_value(i, Val::from_smi(10));
        let i = b.insert_key(new_int(&mut h, 1));
        b.set_value(i, Val::from_smi(11));
        assert!(!a.equal(&b));
    }

    #[test]
    fn test_inc_value() {
        let mut h = heap();
        let mut m = SzlMap::new(4);
        let i = m.insert_key(new_int(&mut h, 5));
        assert!(m.inc_value(&mut h, i, 1).is_err(), "undefined value traps");
        m.set_value(i, Val::from_smi(10));
        m.inc_value(&mut h, i, 7).unwrap();
        assert_eq!(m.fetch(i).as_int(), 17);
    }
}
