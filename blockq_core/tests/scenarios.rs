//! End-to-end scenarios over an on-disk or in-memory repository.

use blockq_core::dag::node::{DagNode, NodeKind};
use blockq_core::dag::reader::DagReader;
use blockq_core::{
    AddInput, AddOptions, Adder, Algorithm, Backend, Block, BlockStore, CancelToken, Codec,
    ErrorKind, FilestoreRef, GcLocker, Layout, MemoryBlockstore, PinMode, PinSet,
    RemoveOptions, Repo, RepoConfig, StoreSet, rm_blocks_sync,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn add_path(repo: &Repo, path: &Path, options: AddOptions) -> blockq_core::Cid {
    repo.adder(options)
        .unwrap()
        .add_all(vec![AddInput::path(path)], &CancelToken::new())
        .unwrap()
        .root
        .unwrap()
}

fn stored_bytes(store: &dyn BlockStore) -> (usize, u64) {
    let keys = store.keys().unwrap();
    let bytes = keys.iter().map(|cid| store.size(cid).unwrap()).sum();
    (keys.len(), bytes)
}

#[test]
fn test_adding_twice_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repo::init(temp_dir.path().join("repo"), RepoConfig::default()).unwrap();

    let source = temp_dir.path().join("tree");
    fs::create_dir_all(source.join("inner")).unwrap();
    fs::write(source.join("big.bin"), pattern(700_000)).unwrap();
    fs::write(source.join("inner/small.txt"), b"small").unwrap();

    let first = add_path(&repo, &source, AddOptions::default());
    let after_first = stored_bytes(&**repo.blocks());

    let second = add_path(&repo, &source, AddOptions::default());
    let after_second = stored_bytes(&**repo.blocks());

    assert_eq!(first, second);
    assert_eq!(after_first, after_second);
}

#[test]
fn test_directory_order_does_not_matter() {
    let temp_dir = TempDir::new().unwrap();

    let make = |name: &str, order: &[&str]| {
        let dir = temp_dir.path().join(name).join("docs");
        fs::create_dir_all(&dir).unwrap();
        for entry in order {
            fs::write(dir.join(entry), entry.as_bytes()).unwrap();
        }
        dir
    };
    let a = make("a", &["one", "two", "three"]);
    let b = make("b", &["three", "one", "two"]);

    let repo_a = Repo::init(temp_dir.path().join("repo-a"), RepoConfig::default()).unwrap();
    let repo_b = Repo::init(temp_dir.path().join("repo-b"), RepoConfig::default()).unwrap();
    assert_eq!(
        add_path(&repo_a, &a, AddOptions::default()),
        add_path(&repo_b, &b, AddOptions::default())
    );
}

#[test]
fn test_twenty_mib_balanced_fixed_chunks() {
    const SIZE: usize = 20 * 1024 * 1024;
    let data = pattern(SIZE);

    let add = || {
        let blocks = Arc::new(MemoryBlockstore::new());
        let dyn_blocks: Arc<dyn BlockStore> = blocks.clone();
        let adder = Adder::new(
            &StoreSet::new(Arc::clone(&dyn_blocks), None),
            Arc::new(PinSet::in_memory(dyn_blocks)),
            Arc::new(GcLocker::new()),
            Algorithm::Blake3,
            AddOptions {
                chunker: "size-262144".to_string(),
                layout: Layout::Balanced,
                raw_leaves: Some(false),
                ..AddOptions::default()
            },
        )
        .unwrap();
        let summary = adder
            .add_all(
                vec![AddInput::reader("big", std::io::Cursor::new(data.clone()))],
                &CancelToken::new(),
            )
            .unwrap();
        (summary.root.unwrap(), blocks)
    };

    let (root, blocks) = add();
    let reader = DagReader::new(&*blocks);
    let top = reader.node(&root).unwrap();

    assert_eq!(top.kind, NodeKind::File);
    assert_eq!(top.links.len(), 80);
    assert_eq!(top.filesize(), SIZE as u64);
    assert!(top.blocksizes.iter().all(|&size| size == 262_144));
    for link in &top.links {
        assert_eq!(link.cid.codec(), Codec::Node.code());
        let leaf = reader.node(&link.cid).unwrap();
        assert!(leaf.links.is_empty());
        assert_eq!(leaf.data.len(), 262_144);
    }

    let (again, _) = add();
    assert_eq!(root, again);
}

/// Bytes with no repeating structure, so content-defined cuts vary.
fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x9e37_79b9_7f4a_7c15u64;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

#[test]
fn test_rabin_chunked_file_reassembles_in_both_layouts() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repo::init(temp_dir.path().join("repo"), RepoConfig::default()).unwrap();

    let data = noise(3 * 1024 * 1024);
    let file = temp_dir.path().join("noise.bin");
    fs::write(&file, &data).unwrap();

    for layout in [Layout::Balanced, Layout::Trickle] {
        let options = AddOptions {
            chunker: "rabin".to_string(),
            layout,
            ..AddOptions::default()
        };
        let root = add_path(&repo, &file, options.clone());
        assert_eq!(add_path(&repo, &file, options), root, "{:?}", layout);

        let mut out = Vec::new();
        repo.cat(&root, &mut out).unwrap();
        assert!(out == data, "{:?} layout changed the content", layout);

        let top = DagReader::new(&**repo.blocks()).node(&root).unwrap();
        assert!(top.links.len() > 1);
        if layout == Layout::Balanced {
            // Content-defined cuts give leaves of differing sizes.
            let first = top.blocksizes[0];
            assert!(top.blocksizes.iter().any(|&size| size != first));
            assert!(top.blocksizes.iter().all(|&size| size <= 393_216));
        }
    }
}

#[test]
fn test_same_bytes_under_two_names() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repo::init(temp_dir.path().join("repo"), RepoConfig::default()).unwrap();

    let first = temp_dir.path().join("first.txt");
    let second = temp_dir.path().join("second.dat");
    fs::write(&first, b"ten bytes!").unwrap();
    fs::write(&second, b"ten bytes!").unwrap();

    let summary = repo
        .adder(AddOptions::default())
        .unwrap()
        .add_all(
            vec![AddInput::path(&first), AddInput::path(&second)],
            &CancelToken::new(),
        )
        .unwrap();

    assert_eq!(summary.roots.len(), 2);
    assert_eq!(summary.roots[0].1, summary.roots[1].1);
    assert_eq!(summary.root, None);
}

#[test]
fn test_pinned_root_is_not_removed() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repo::init(temp_dir.path().join("repo"), RepoConfig::default()).unwrap();

    let root = repo.put_block(b"precious".to_vec(), None).unwrap();
    repo.pin(&root, PinMode::Recursive).unwrap();

    let outcomes: Vec<_> = repo
        .rm_blocks(vec![root], RemoveOptions::default(), CancelToken::new())
        .unwrap()
        .iter()
        .collect();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].hash, root.to_string());
    assert_eq!(outcomes[0].kind, Some(ErrorKind::PinConflict));
    assert!(outcomes[0].error.as_deref().unwrap().contains("recursive"));
    assert_eq!(repo.get_block(&root).unwrap().data(), b"precious");
}

#[test]
fn test_force_semantics() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repo::init(temp_dir.path().join("repo"), RepoConfig::default()).unwrap();
    let absent = repo.default_prefix().sum(b"never stored").unwrap();

    let strict: Vec<_> = repo
        .rm_blocks(vec![absent], RemoveOptions::default(), CancelToken::new())
        .unwrap()
        .iter()
        .collect();
    assert_eq!(strict.len(), 1);
    assert_eq!(strict[0].kind, Some(ErrorKind::NotFound));

    let forced: Vec<_> = repo
        .rm_blocks(
            vec![absent],
            RemoveOptions {
                force: true,
                ..RemoveOptions::default()
            },
            CancelToken::new(),
        )
        .unwrap()
        .iter()
        .collect();
    assert!(forced.iter().all(|o| !o.is_error()));
}

fn filestore_repo(temp_dir: &TempDir) -> Repo {
    let config = RepoConfig {
        filestore: true,
        ..RepoConfig::default()
    };
    Repo::init(temp_dir.path().join("repo"), config).unwrap()
}

fn remove_from(repo: &Repo, cid: blockq_core::Cid, backend: Backend) -> blockq_core::RemovedBlock {
    let options = RemoveOptions {
        backend,
        ..RemoveOptions::default()
    };
    let mut outcomes = rm_blocks_sync(
        repo.stores(),
        repo.locker(),
        &**repo.pins(),
        &[cid],
        &options,
        &CancelToken::new(),
    )
    .unwrap();
    assert_eq!(outcomes.len(), 1);
    outcomes.remove(0)
}

#[test]
fn test_filestore_copy_removable_when_plain_copy_exists() {
    let temp_dir = TempDir::new().unwrap();
    let repo = filestore_repo(&temp_dir);
    let manager = repo.filestore().unwrap().clone();

    let file = temp_dir.path().join("data.bin");
    let data = pattern(10_000);
    fs::write(&file, &data).unwrap();

    let root = add_path(
        &repo,
        &file,
        AddOptions {
            chunker: "size-4096".to_string(),
            no_copy: true,
            ..AddOptions::default()
        },
    );
    let leaves = blockq_core::dag::links(&**repo.blocks(), &root).unwrap();
    assert_eq!(leaves.len(), 3);
    let leaf = leaves[0];
    assert!(manager.has(&leaf).unwrap());
    assert!(!repo.blocks().has(&leaf).unwrap());

    // Only copy is the filestore one: refused.
    assert!(!repo.stores().available_elsewhere(Backend::Filestore, &leaf));
    let refused = remove_from(&repo, leaf, Backend::Filestore);
    assert_eq!(refused.kind, Some(ErrorKind::PinConflict));

    // A plain copy makes the filestore reference redundant.
    let bytes = manager.get(&leaf).unwrap().into_data();
    repo.blocks().put(Block::with_cid(leaf, bytes).unwrap()).unwrap();
    assert!(repo.stores().available_elsewhere(Backend::Filestore, &leaf));

    let removed = remove_from(&repo, leaf, Backend::Filestore);
    assert!(!removed.is_error());
    assert!(!manager.has(&leaf).unwrap());

    let mut out = Vec::new();
    repo.cat(&root, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_plain_copy_removable_when_filestore_copy_exists() {
    let temp_dir = TempDir::new().unwrap();
    let repo = filestore_repo(&temp_dir);
    let manager = repo.filestore().unwrap().clone();

    let file = temp_dir.path().join("data.bin");
    let data = pattern(10_000);
    fs::write(&file, &data).unwrap();

    let root = add_path(
        &repo,
        &file,
        AddOptions {
            chunker: "size-4096".to_string(),
            raw_leaves: Some(true),
            ..AddOptions::default()
        },
    );
    let leaf = blockq_core::dag::links(&**repo.blocks(), &root).unwrap()[0];
    assert!(repo.blocks().has(&leaf).unwrap());

    let refused = remove_from(&repo, leaf, Backend::Blocks);
    assert_eq!(refused.kind, Some(ErrorKind::PinConflict));

    manager
        .register(FilestoreRef {
            cid: leaf,
            path: fs::canonicalize(&file).unwrap(),
            offset: 0,
            size: 4096,
        })
        .unwrap();
    assert!(repo.stores().available_elsewhere(Backend::Blocks, &leaf));

    let removed = remove_from(&repo, leaf, Backend::Blocks);
    assert!(!removed.is_error());
    assert!(!repo.blocks().has(&leaf).unwrap());

    let mut out = Vec::new();
    repo.cat(&root, &mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_gc_keeps_pinned_and_drops_rest() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repo::init(temp_dir.path().join("repo"), RepoConfig::default()).unwrap();

    let kept = temp_dir.path().join("kept.bin");
    fs::write(&kept, pattern(300_000)).unwrap();
    let root = add_path(&repo, &kept, AddOptions::default());

    let loose = repo.put_block(b"loose".to_vec(), None).unwrap();

    let stats = repo.gc(false).unwrap();
    assert_eq!(stats.blocks_deleted, 1);
    assert!(!repo.blocks().has(&loose).unwrap());

    let mut out = Vec::new();
    repo.cat(&root, &mut out).unwrap();
    assert_eq!(out.len(), 300_000);

    repo.unpin(&root, true).unwrap();
    repo.gc(false).unwrap();
    assert!(repo.blocks().keys().unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn test_symlink_roundtrip() {
    let temp_dir = TempDir::new().unwrap();
    let repo = Repo::init(temp_dir.path().join("repo"), RepoConfig::default()).unwrap();

    let dir = temp_dir.path().join("with-link");
    fs::create_dir(&dir).unwrap();
    fs::write(dir.join("target.txt"), b"target").unwrap();
    std::os::unix::fs::symlink("target.txt", dir.join("link")).unwrap();

    let root = add_path(&repo, &dir, AddOptions::default());
    let listing = DagReader::new(&**repo.blocks()).node(&root).unwrap();
    let link = listing
        .links
        .iter()
        .find(|l| l.name.as_deref() == Some("link"))
        .unwrap();
    let node = DagNode::decode(repo.get_block(&link.cid).unwrap().data()).unwrap();
    assert_eq!(node.kind, NodeKind::Symlink);

    let dest = temp_dir.path().join("restored");
    repo.export(&root, &dest).unwrap();
    assert_eq!(
        fs::read_link(dest.join("link")).unwrap(),
        Path::new("target.txt")
    );
}
