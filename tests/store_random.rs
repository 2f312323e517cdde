//! Randomized push/read interleavings against the box arena.

use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use veriboost::interval::Interval;
use veriboost::{BoxRef, BoxStore, DomainPair};

fn random_box(rng: &mut Xoshiro256PlusPlus) -> Vec<DomainPair> {
    let n_dims = rng.gen_range(0..6);
    let mut feats: Vec<u32> = Vec::new();
    while feats.len() < n_dims {
        let f = rng.gen_range(0..12u32);
        if !feats.contains(&f) {
            feats.push(f);
        }
    }
    feats.sort_unstable();
    feats
        .into_iter()
        .map(|f| {
            let lo = rng.gen_range(-10.0f32..9.0);
            let hi = rng.gen_range(lo + 0.1..11.0);
            (f, Interval::new(lo, hi))
        })
        .collect()
}

#[test]
fn refs_survive_interleaved_pushes_and_reads() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(0x5eed);
    let mut store = BoxStore::new();
    let mut committed: Vec<(BoxRef, Vec<DomainPair>)> = Vec::new();

    for round in 0..5000 {
        let pairs = random_box(&mut rng);
        let r = store.push_pairs(&pairs).unwrap();
        committed.push((r, pairs));

        // re-read a handful of random earlier commits
        for _ in 0..3 {
            let (r, expected) = &committed[rng.gen_range(0..committed.len())];
            assert_eq!(store.get(*r), expected.as_slice(), "round {round}");
        }
    }

    // everything is still intact at the end
    for (r, expected) in &committed {
        assert_eq!(store.get(*r), expected.as_slice());
    }
}

#[test]
fn workspace_commits_interleave_with_raw_pushes() {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
    let mut store = BoxStore::new();
    let mut committed: Vec<(BoxRef, Vec<DomainPair>)> = Vec::new();

    for _ in 0..2000 {
        if rng.gen_bool(0.5) {
            let pairs = random_box(&mut rng);
            let r = store.push_pairs(&pairs).unwrap();
            committed.push((r, pairs));
        } else {
            // build through the workspace: combine two earlier boxes
            if committed.len() < 2 {
                continue;
            }
            let (a, _) = committed[rng.gen_range(0..committed.len())];
            let (b, _) = committed[rng.gen_range(0..committed.len())];
            if let Some(r) = store.combine_and_push(a, b).unwrap() {
                let pairs = store.get(r).to_vec();
                committed.push((r, pairs));
            }
            assert!(store.workspace_box().is_empty());
        }
    }

    for (r, expected) in &committed {
        assert_eq!(store.get(*r), expected.as_slice());
    }
}

#[test]
fn tight_ceiling_surfaces_out_of_memory() {
    let pair_size = std::mem::size_of::<DomainPair>();
    let mut store = BoxStore::with_mem_capacity(pair_size * 64);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);

    let mut err = None;
    for _ in 0..10_000 {
        let pairs = random_box(&mut rng);
        if pairs.is_empty() {
            continue;
        }
        match store.push_pairs(&pairs) {
            Ok(_) => {}
            Err(e) => {
                err = Some(e);
                break;
            }
        }
    }
    assert!(matches!(
        err,
        Some(veriboost::SearchError::OutOfMemory { .. })
    ));
}
