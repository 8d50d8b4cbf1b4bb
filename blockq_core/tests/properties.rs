//! Property tests over ingestion and removal.

use blockq_core::dag::reader::DagReader;
use blockq_core::{
    AddInput, AddOptions, Adder, Algorithm, BlockStore, CancelToken, Cid, GcLocker, Layout,
    MemoryBlockstore, PinMode, PinSet, Pinner, RemoveOptions, StoreSet, rm_blocks_sync,
};
use proptest::prelude::*;
use proptest::sample::Index;
use std::collections::HashSet;
use std::sync::Arc;

struct Harness {
    blocks: Arc<dyn BlockStore>,
    stores: StoreSet,
    pins: Arc<PinSet>,
    locker: Arc<GcLocker>,
}

impl Harness {
    fn new() -> Self {
        let blocks: Arc<dyn BlockStore> = Arc::new(MemoryBlockstore::new());
        Self {
            stores: StoreSet::new(Arc::clone(&blocks), None),
            pins: Arc::new(PinSet::in_memory(Arc::clone(&blocks))),
            locker: Arc::new(GcLocker::new()),
            blocks,
        }
    }

    fn add(&self, data: &[u8], options: AddOptions) -> Cid {
        Adder::new(
            &self.stores,
            self.pins.clone(),
            Arc::clone(&self.locker),
            Algorithm::Blake3,
            options,
        )
        .unwrap()
        .add_all(
            vec![AddInput::reader("input", std::io::Cursor::new(data.to_vec()))],
            &CancelToken::new(),
        )
        .unwrap()
        .root
        .unwrap()
    }
}

fn chunker_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("size-256"),
        Just("size-1000"),
        Just("rabin-64-256-1024"),
    ]
}

fn layout_strategy() -> impl Strategy<Value = Layout> {
    prop_oneof![Just(Layout::Balanced), Just(Layout::Trickle)]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 48,
        max_shrink_iters: 2000,
        ..ProptestConfig::default()
    })]

    /// Reassembling any DAG reproduces the input exactly.
    #[test]
    fn prop_roundtrip(
        data in prop::collection::vec(any::<u8>(), 0..20_000),
        chunker in chunker_strategy(),
        layout in layout_strategy(),
        raw_leaves in any::<bool>(),
    ) {
        let harness = Harness::new();
        let options = AddOptions {
            chunker: chunker.to_string(),
            layout,
            raw_leaves: Some(raw_leaves),
            pin: false,
            ..AddOptions::default()
        };
        let root = harness.add(&data, options);
        let out = DagReader::new(&*harness.blocks).read_all(&root).unwrap();
        prop_assert_eq!(out, data);
    }

    /// Identical input and options give identical roots in separate stores.
    #[test]
    fn prop_deterministic(
        data in prop::collection::vec(any::<u8>(), 0..8_000),
        chunker in chunker_strategy(),
        layout in layout_strategy(),
    ) {
        let options = AddOptions {
            chunker: chunker.to_string(),
            layout,
            ..AddOptions::default()
        };
        let first = Harness::new().add(&data, options.clone());
        let second = Harness::new().add(&data, options);
        prop_assert_eq!(first, second);
    }

    /// No block reachable from a pin is ever removed when it has no other copy.
    #[test]
    fn prop_pin_safety(
        files in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..1_500), 1..5),
        pin_flags in prop::collection::vec(any::<bool>(), 5),
        direct in prop::collection::vec(any::<Index>(), 0..3),
        requests in prop::collection::vec(any::<Index>(), 0..24),
        force in any::<bool>(),
    ) {
        let harness = Harness::new();
        let options = AddOptions {
            chunker: "size-128".to_string(),
            pin: false,
            ..AddOptions::default()
        };

        let roots: Vec<Cid> = files.iter().map(|data| harness.add(data, options.clone())).collect();
        for (root, pinned) in roots.iter().zip(&pin_flags) {
            if *pinned {
                harness.pins.pin(root, PinMode::Recursive).unwrap();
            }
        }

        let keys = harness.blocks.keys().unwrap();
        for index in &direct {
            let cid = keys[index.index(keys.len())];
            // Already recursively pinned roots reject direct pins.
            let _ = harness.pins.pin(&cid, PinMode::Direct);
        }

        let protected = harness.pins.pinned_set().unwrap();
        let targets: Vec<Cid> = requests.iter().map(|i| keys[i.index(keys.len())]).collect();
        let options = RemoveOptions { force, ..RemoveOptions::default() };

        let outcomes = rm_blocks_sync(
            &harness.stores,
            &harness.locker,
            &*harness.pins,
            &targets,
            &options,
            &CancelToken::new(),
        )
        .unwrap();

        for cid in &protected {
            prop_assert!(harness.blocks.has(cid).unwrap(), "pinned block {} was removed", cid);
        }
        let removed: HashSet<String> = outcomes
            .iter()
            .filter(|o| !o.is_error())
            .map(|o| o.hash.clone())
            .collect();
        for cid in &protected {
            prop_assert!(!removed.contains(&cid.to_string()));
        }
        for cid in targets.iter().filter(|cid| !protected.contains(cid)) {
            prop_assert!(!harness.blocks.has(cid).unwrap());
        }
    }
}
