#![cfg(test)]

// Property tests for Dict kept inside the crate so they can reach the
// deep invariant checker.

use crate::dict::{Dict, InsertError, Upsert};
use core::hash::{BuildHasher, Hasher};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};

// Pool-indexed operations to improve shrinking: indices shrink to earlier
// keys, the pool shrinks, and op lists shrink in length.
#[derive(Clone, Debug)]
enum Op {
    Insert(usize, i32),
    Upsert(usize, i32),
    Remove(usize),
    Find(usize),
    Contains(usize),
    RehashStep(usize),
    Expand(usize),
    ResizeToFit,
    ScanAll,
    Iterate,
    Clear,
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<Op>)> {
    proptest::collection::vec("[a-z]{1,6}", 1..=10).prop_flat_map(|pool| {
        let pool: Vec<String> = {
            let mut p = pool;
            p.sort();
            p.dedup();
            p
        };
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let op = prop_oneof![
            8 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Insert(i, v)),
            4 => (idx.clone(), any::<i32>()).prop_map(|(i, v)| Op::Upsert(i, v)),
            4 => idx.clone().prop_map(Op::Remove),
            4 => idx.clone().prop_map(Op::Find),
            2 => idx.clone().prop_map(Op::Contains),
            2 => (1usize..4).prop_map(Op::RehashStep),
            1 => (0usize..64).prop_map(Op::Expand),
            1 => Just(Op::ResizeToFit),
            2 => Just(Op::ScanAll),
            2 => Just(Op::Iterate),
            1 => Just(Op::Clear),
        ];
        proptest::collection::vec(op, 1..80).prop_map(move |ops| (pool.clone(), ops))
    })
}

fn run_scenario<S>(hasher: S, pool: &[String], ops: Vec<Op>) -> Result<(), TestCaseError>
where
    S: BuildHasher,
{
    let mut sut: Dict<String, i32, S> = Dict::with_hasher(hasher);
    let mut model: HashMap<String, i32> = HashMap::new();

    for op in ops {
        match op {
            Op::Insert(i, v) => {
                let k = pool[i].clone();
                let already = model.contains_key(&k);
                match sut.insert(k.clone(), v) {
                    Ok(h) => {
                        prop_assert!(!already, "insert must fail on duplicate");
                        prop_assert_eq!(h.key(&sut), Some(&k));
                        model.insert(k, v);
                    }
                    Err(InsertError::KeyExists) => {
                        prop_assert!(already, "duplicate error only when key exists");
                    }
                }
            }
            Op::Upsert(i, v) => {
                let k = pool[i].clone();
                let already = model.contains_key(&k);
                match sut.upsert(k.clone(), v) {
                    Upsert::Inserted(_) => prop_assert!(!already),
                    Upsert::Replaced(_) => prop_assert!(already),
                }
                model.insert(k, v);
            }
            Op::Remove(i) => {
                let k = &pool[i];
                let got = sut.remove(k);
                let expected = model.remove(k);
                match (got, expected) {
                    (Some((rk, rv)), Some(mv)) => {
                        prop_assert_eq!(&rk, k);
                        prop_assert_eq!(rv, mv);
                    }
                    (None, None) => {}
                    other => prop_assert!(false, "remove parity broke: {:?}", other),
                }
            }
            Op::Find(i) => {
                let k = pool[i].clone();
                let got = sut.find(&k);
                prop_assert_eq!(got.is_some(), model.contains_key(&k));
                if let Some(h) = got {
                    prop_assert_eq!(h.value(&sut), model.get(&k));
                }
            }
            Op::Contains(i) => {
                let k = &pool[i];
                prop_assert_eq!(sut.contains_key(k), model.contains_key(k));
                prop_assert_eq!(sut.get(k), model.get(k));
            }
            Op::RehashStep(n) => {
                sut.rehash(n);
            }
            Op::Expand(size) => {
                // Any outcome is legal; the invariant check below decides
                // whether the structure stayed sound.
                let _ = sut.expand(size);
            }
            Op::ResizeToFit => {
                let _ = sut.resize_to_fit();
            }
            Op::ScanAll => {
                let mut seen = BTreeSet::new();
                let mut cursor = 0;
                loop {
                    cursor = sut.scan(cursor, |k, _| {
                        seen.insert(k.clone());
                    });
                    if cursor == 0 {
                        break;
                    }
                }
                let expected: BTreeSet<String> = model.keys().cloned().collect();
                prop_assert_eq!(seen, expected);
            }
            Op::Iterate => {
                let seen: BTreeSet<String> = sut.iter().map(|(_, k, _)| k.clone()).collect();
                let expected: BTreeSet<String> = model.keys().cloned().collect();
                prop_assert_eq!(seen, expected);
            }
            Op::Clear => {
                sut.clear();
                model.clear();
            }
        }

        // Post-conditions after every op.
        prop_assert_eq!(sut.len(), model.len());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
        sut.check_invariants();
    }
    Ok(())
}

// Property: state-machine equivalence against std's HashMap across random
// operation sequences, including explicit resizes and partial rehash
// steps interleaved at arbitrary points. After every operation the deep
// structural invariants hold: power-of-two table sizes, per-table used
// counts matching the chains, every arena entry linked exactly once, and
// all buckets below the migration cursor drained.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_scenario(crate::hash::Murmur2State::default(), &pool, ops)?;
    }
}

// Collision variant: a constant hasher forces every key into one chain,
// stressing equality probing, chain unlinking, and whole-chain migration.
#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;

impl BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> ConstHasher {
        ConstHasher
    }
}

impl Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in arb_scenario()) {
        run_scenario(ConstBuildHasher, &pool, ops)?;
    }
}
