//! Integration tests for the build publish / snapshot / read pipeline.
//!
//! These tests drive the public surface the build-completion and
//! sandbox-start flows use: upload a finished build, register a snapshot
//! on top of it, and read artifact bytes back through the header lineage.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use sandpool_blockmap::{BlockSource, Header, Metadata};
use sandpool_snapstore::build::{remove_build, ArtifactKind, BuildUpload, Diff, LocalDiff};
use sandpool_snapstore::storage::{layout, BlobClient, MemoryStore};
use sandpool_snapstore::template::{TemplateCache, TemplateIdentity};
use sandpool_snapstore::StoreConfig;

const BLOCK_SIZE: u32 = 4096;
const BLOCKS: u64 = 4;
const ARTIFACT_SIZE: u64 = BLOCKS * BLOCK_SIZE as u64;

fn identity(build_id: &str) -> TemplateIdentity {
    TemplateIdentity {
        template_id: "ubuntu-base".to_string(),
        build_id: build_id.to_string(),
        kernel_version: "6.1.102".to_string(),
        firecracker_version: "1.10.1".to_string(),
        huge_pages: false,
        snapshot: false,
    }
}

fn cache_for(dir: &TempDir, store: Arc<MemoryStore>) -> TemplateCache {
    TemplateCache::new(
        StoreConfig {
            cache_root: dir.path().to_path_buf(),
            ..StoreConfig::default()
        },
        store,
    )
}

/// Header mapping every block of the artifact to the build's own diff.
fn base_header(build_id: &str, kind: ArtifactKind) -> Header {
    let key = layout::diff_key(build_id, kind);
    let mut map = BTreeMap::new();
    for i in 0..BLOCKS {
        map.insert(i, BlockSource::Remote(key.clone()));
    }
    Header::new(Metadata::new(1, ARTIFACT_SIZE, BLOCK_SIZE), map).unwrap()
}

/// Publish a full base build: both diffs, both headers, boot descriptor.
async fn publish_base(blob: &BlobClient, scratch: &Path, build_id: &str, byte: u8) {
    let upload = BuildUpload::new(blob.clone(), build_id);
    for kind in ArtifactKind::ALL {
        let path = scratch.join(format!("{}.{}", build_id, kind));
        std::fs::write(&path, vec![byte; ARTIFACT_SIZE as usize]).unwrap();
        upload
            .put_artifact(kind, &Diff::Local(LocalDiff::new(&path)), &base_header(build_id, kind))
            .await
            .unwrap();
    }
    let boot = scratch.join(format!("{}.bootdesc", build_id));
    std::fs::write(&boot, b"vmlinux console=ttyS0").unwrap();
    upload.put_boot_descriptor(&boot).await.unwrap();
}

#[tokio::test]
async fn test_publish_then_hydrate_round_trip() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let cache = cache_for(&dir, store.clone());

    publish_base(cache.blob(), dir.path(), "b1", b'a').await;

    let template = cache.get_or_create(&identity("b1")).unwrap();
    template.hydrated().await.unwrap();

    let memory = template.memory().await.unwrap();
    assert_eq!(memory.size(), ARTIFACT_SIZE);
    assert_eq!(
        memory.read_all().await.unwrap(),
        vec![b'a'; ARTIFACT_SIZE as usize]
    );

    let boot = template.boot_descriptor().await.unwrap();
    assert_eq!(std::fs::read(&boot).unwrap(), b"vmlinux console=ttyS0");

    cache.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_then_fetch() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let cache = cache_for(&dir, store.clone());

    publish_base(cache.blob(), dir.path(), "b1", b'a').await;
    let parent = cache.get_or_create(&identity("b1")).unwrap();
    parent.hydrated().await.unwrap();

    // Child build touched memory blocks {0, 1} and left rootfs unchanged.
    let diff_path = dir.path().join("b2.memory.diff");
    std::fs::write(&diff_path, vec![b'n'; 2 * BLOCK_SIZE as usize]).unwrap();

    let memory_parent = parent.memory().await.unwrap().header().clone();
    let rootfs_parent = parent.rootfs().await.unwrap().header().clone();

    let mut touched = BTreeMap::new();
    for i in 0..2u64 {
        touched.insert(
            i,
            BlockSource::Local(diff_path.to_string_lossy().into_owned()),
        );
    }
    let memory_header = Header::for_snapshot(memory_parent, touched).unwrap();
    let rootfs_header = Header::for_snapshot(rootfs_parent, BTreeMap::new()).unwrap();

    let boot = dir.path().join("b2.bootdesc");
    std::fs::write(&boot, b"vmlinux console=ttyS0").unwrap();

    let child = identity("b2");
    cache
        .add_snapshot(
            &child,
            Arc::new(memory_header),
            Arc::new(rootfs_header),
            boot,
            Diff::Local(LocalDiff::new(&diff_path)),
            Diff::None,
        )
        .unwrap();

    // No-change rootfs diff never lands in the registry.
    assert!(cache
        .diff_store()
        .get("b2", ArtifactKind::Rootfs)
        .is_none());
    assert!(cache
        .diff_store()
        .get("b2", ArtifactKind::Memory)
        .is_some());

    // A later lookup for the new build hits the snapshot entry; the
    // template is already hydrated since its parts were in hand.
    let template = cache.get_or_create(&child).unwrap();
    template.hydrated().await.unwrap();

    let memory = template.memory().await.unwrap().read_all().await.unwrap();
    assert_eq!(&memory[..2 * BLOCK_SIZE as usize], &vec![b'n'; 2 * BLOCK_SIZE as usize][..]);
    assert_eq!(
        &memory[2 * BLOCK_SIZE as usize..],
        &vec![b'a'; 2 * BLOCK_SIZE as usize][..]
    );

    // Rootfs delegates entirely to the parent build's data.
    let rootfs = template.rootfs().await.unwrap().read_all().await.unwrap();
    assert_eq!(rootfs, vec![b'a'; ARTIFACT_SIZE as usize]);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_snapshot_close_releases_diffs() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let cache = cache_for(&dir, store.clone());

    publish_base(cache.blob(), dir.path(), "b1", b'a').await;
    let parent = cache.get_or_create(&identity("b1")).unwrap();
    parent.hydrated().await.unwrap();

    let diff_path = dir.path().join("b2.memory.diff");
    std::fs::write(&diff_path, vec![b'n'; BLOCK_SIZE as usize]).unwrap();
    let mut touched = BTreeMap::new();
    touched.insert(
        0u64,
        BlockSource::Local(diff_path.to_string_lossy().into_owned()),
    );
    let memory_header =
        Header::for_snapshot(parent.memory().await.unwrap().header().clone(), touched).unwrap();
    let rootfs_header =
        Header::for_snapshot(parent.rootfs().await.unwrap().header().clone(), BTreeMap::new())
            .unwrap();

    let boot = dir.path().join("b2.bootdesc");
    std::fs::write(&boot, b"boot").unwrap();
    let template = cache
        .add_snapshot(
            &identity("b2"),
            Arc::new(memory_header),
            Arc::new(rootfs_header),
            boot,
            Diff::Local(LocalDiff::new(&diff_path)),
            Diff::None,
        )
        .unwrap();

    assert_eq!(cache.diff_store().build_count(), 1);
    template.close().unwrap();
    assert_eq!(cache.diff_store().build_count(), 0);

    cache.shutdown().await;
}

#[tokio::test]
async fn test_remove_build_deletes_every_object() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let blob = BlobClient::new(store.clone());

    publish_base(&blob, dir.path(), "b1", b'a').await;
    publish_base(&blob, dir.path(), "b2", b'b').await;
    assert_eq!(store.object_count().await, 10);

    remove_build(&blob, "b1").await.unwrap();
    assert_eq!(store.object_count().await, 5);
    assert!(store.contains("b2/memory").await);
    assert!(!store.contains("b1/memory").await);
}
