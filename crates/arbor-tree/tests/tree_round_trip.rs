mod common;

use std::sync::Arc;

use arbor_bundle::Bundle;
use arbor_storage::{InMemoryBackend, RefCacheTime, RefOptions, StorageBackend};
use arbor_tree::{NodeDecode, StorageConfig, StorageError, TreeNodeRef};
use arbor_types::{ContentHash, NodeHandle};
use futures::TryStreamExt;

use common::{branch, client, describe, leaf, ref_name, serialized, Branch, Leaf};

async fn only_bundle(backend: &InMemoryBackend) -> Bundle {
    let blobs = backend.blob_locators();
    assert_eq!(blobs.len(), 1, "expected a single bundle, found {blobs:?}");
    Bundle::from_bytes(&backend.read_blob(&blobs[0]).await.unwrap()).unwrap()
}

#[tokio::test]
async fn tree_round_trips_through_a_fresh_client() {
    let backend = Arc::new(InMemoryBackend::new());
    let writer_client = client(backend.clone(), StorageConfig::default());
    let mut root = branch(
        "root",
        vec![leaf("a"), branch("dir", vec![leaf("b"), leaf("c")]), leaf("d")],
    );
    let handle = writer_client
        .write_tree(&ref_name("main"), &mut root, RefOptions::default())
        .await
        .unwrap();
    assert!(handle.is_resolved());

    let reader_client = client(backend, StorageConfig::default());
    let read = reader_client.read_tree::<Branch>(&ref_name("main")).await.unwrap();
    assert_eq!(read.handle(), Some(&handle));
    assert_eq!(read.get::<Branch>().unwrap().children.len(), 3);

    let shape = describe(read, reader_client.reader()).await;
    assert_eq!(shape, "root[a,dir[b,c],d]");
}

#[tokio::test]
async fn identical_children_share_one_export() {
    let backend = Arc::new(InMemoryBackend::new());
    let client = client(backend.clone(), StorageConfig::default());
    let mut root = branch("root", vec![leaf("same"), leaf("same")]);

    let mut writer = client.writer();
    writer.write_ref(&mut root).await.unwrap();
    writer.flush().await.unwrap();

    let children = &root.get::<Branch>().unwrap().children;
    let first = children[0].handle().unwrap();
    let second = children[1].handle().unwrap();
    assert_eq!(first.hash(), second.hash());
    assert_eq!(first.locator(), second.locator());
    assert_eq!(first, second);
    assert_eq!(writer.stats().dedup_hits, 1);

    let bundle = only_bundle(&backend).await;
    assert_eq!(bundle.header.exports.len(), 2);
    assert_eq!(bundle.header.exports[1].references, vec![0, 0]);
}

#[tokio::test]
async fn child_export_precedes_its_parent() {
    let backend = Arc::new(InMemoryBackend::new());
    let client = client(backend.clone(), StorageConfig::default());
    let mut root = branch("R", vec![leaf("C")]);

    let mut writer = client.writer();
    let root_handle = writer.write_ref(&mut root).await.unwrap();
    writer.flush().await.unwrap();

    let bundle = only_bundle(&backend).await;
    let header = &bundle.header;
    assert_eq!(header.exports.len(), 2);
    assert!(header.imports.is_empty());
    assert_eq!(header.exports[0].hash, ContentHash::of(&serialized(&Leaf::new("C"))));
    assert_eq!(header.exports[1].hash, root_handle.hash());
    assert_eq!(header.exports[1].references, vec![0]);
    assert_eq!(
        header.types,
        vec![<Leaf as NodeDecode>::NODE_TYPE, <Branch as NodeDecode>::NODE_TYPE]
    );
}

#[tokio::test]
async fn rewrite_only_touches_dirty_nodes() {
    let backend = Arc::new(InMemoryBackend::new());
    let client = client(backend.clone(), StorageConfig::default());
    let name = ref_name("main");
    let mut root = branch("root", vec![leaf("a"), branch("dir", vec![leaf("b")])]);
    client
        .write_tree(&name, &mut root, RefOptions::default())
        .await
        .unwrap();

    // Written subtrees are released; the root stays resident.
    assert!(root.is_resident());
    assert!(!root.is_dirty());
    assert!(root
        .get::<Branch>()
        .unwrap()
        .children
        .iter()
        .all(TreeNodeRef::is_collapsed));

    {
        let branch = root.get_mut::<Branch>().unwrap();
        branch.children[0].expand(client.reader()).await.unwrap();
        branch.children[0].get_mut::<Leaf>().unwrap().value = b"z".to_vec();
    }
    assert!(root.is_dirty());

    let mut writer = client.writer();
    let handle = writer.write_ref(&mut root).await.unwrap();
    writer.flush().await.unwrap();
    assert_eq!(writer.stats().nodes_admitted, 2);
    client
        .write_ref_target(&name, &handle, RefOptions::default())
        .await
        .unwrap();

    let read = client.read_tree::<Branch>(&name).await.unwrap();
    assert_eq!(describe(read, client.reader()).await, "root[z,dir[b]]");
    assert_eq!(backend.blob_count(), 2);
}

#[tokio::test]
async fn clean_tree_writes_nothing() {
    let backend = Arc::new(InMemoryBackend::new());
    let client = client(backend.clone(), StorageConfig::default());
    let mut root = branch("root", vec![leaf("a")]);
    let first = client
        .write_tree(&ref_name("main"), &mut root, RefOptions::default())
        .await
        .unwrap();

    let mut writer = client.writer();
    let second = writer.write_ref(&mut root).await.unwrap();
    writer.flush().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(writer.stats().nodes_admitted, 0);
    assert_eq!(backend.blob_count(), 1);
}

#[tokio::test]
async fn aliases_are_reported_to_the_backend() {
    let backend = Arc::new(InMemoryBackend::new());
    let client = client(backend.clone(), StorageConfig::default());
    let mut root = TreeNodeRef::new(Branch::new("root", vec![leaf("x")]).with_alias("release"));
    let handle = client
        .write_tree(&ref_name("main"), &mut root, RefOptions::default())
        .await
        .unwrap();

    let found: Vec<NodeHandle> = client
        .find_nodes_by_alias("release")
        .try_collect()
        .await
        .unwrap();
    assert_eq!(found, vec![handle]);
    assert!(client
        .find_nodes_by_alias("nothing")
        .try_collect::<Vec<_>>()
        .await
        .unwrap()
        .is_empty());

    let bundle = only_bundle(&backend).await;
    assert_eq!(bundle.header.exports[0].alias, None);
    assert_eq!(bundle.header.exports[1].alias.as_deref(), Some("release"));
}

#[tokio::test]
async fn alias_on_a_duplicate_write_is_registered() {
    let backend = Arc::new(InMemoryBackend::new());
    let client = client(backend.clone(), StorageConfig::default());
    let tagged = |alias: &str| TreeNodeRef::new(Branch::new("root", vec![]).with_alias(alias));

    let mut writer = client.writer();
    let plain = writer.write_ref(&mut branch("root", vec![])).await.unwrap();
    let pending = writer.write_ref(&mut tagged("draft")).await.unwrap();
    writer.flush().await.unwrap();
    assert_eq!(writer.stats().dedup_hits, 1);
    assert_eq!(plain, pending);

    let mut later = client.writer();
    let written = later.write_ref(&mut tagged("release")).await.unwrap();
    later.flush().await.unwrap();
    assert_eq!(later.stats().nodes_admitted, 0);

    for alias in ["draft", "release"] {
        let found: Vec<NodeHandle> = client
            .find_nodes_by_alias(alias)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(found, vec![plain.clone()], "{alias}");
    }
    assert_eq!(written, plain);
    assert_eq!(only_bundle(&backend).await.header.exports[0].alias, None);
}

#[tokio::test]
async fn ref_lookups() {
    let backend = Arc::new(InMemoryBackend::new());
    let client = client(backend, StorageConfig::default());
    let name = ref_name("missing");

    assert!(client
        .try_read_ref_target(&name, RefCacheTime::Coherent)
        .await
        .unwrap()
        .is_none());
    assert!(matches!(
        client.read_ref_target(&name, RefCacheTime::Coherent).await,
        Err(StorageError::RefNotFound(missing)) if missing == name
    ));
    assert!(matches!(
        client.read_tree::<Branch>(&name).await,
        Err(StorageError::RefNotFound(_))
    ));
}

#[tokio::test]
async fn refs_only_point_at_written_nodes() {
    let backend = Arc::new(InMemoryBackend::new());
    let client = client(backend, StorageConfig::default());
    let name = ref_name("main");

    let mut writer = client.writer();
    let data = serialized(&Leaf::new("x"));
    let pending = writer
        .write_node(<Leaf as NodeDecode>::NODE_TYPE, &data, &[], None)
        .await
        .unwrap();
    assert!(matches!(
        client
            .write_ref_target(&name, &pending, RefOptions::default())
            .await,
        Err(StorageError::Consistency(_))
    ));

    writer.flush().await.unwrap();
    client
        .write_ref_target(&name, &pending, RefOptions::default())
        .await
        .unwrap();
    let target = client
        .read_ref_target(&name, RefCacheTime::Coherent)
        .await
        .unwrap();
    assert_eq!(target, pending);

    assert!(client.delete_ref(&name).await.unwrap());
    assert!(!client.delete_ref(&name).await.unwrap());
    assert!(client
        .try_read_ref_target(&name, RefCacheTime::Coherent)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn read_tree_checks_the_root_type() {
    let backend = Arc::new(InMemoryBackend::new());
    let client = client(backend, StorageConfig::default());
    let mut root = leaf("just a leaf");
    client
        .write_tree(&ref_name("main"), &mut root, RefOptions::default())
        .await
        .unwrap();

    assert!(matches!(
        client.read_tree::<Branch>(&ref_name("main")).await,
        Err(StorageError::Consistency(_))
    ));
    let read = client.read_tree::<Leaf>(&ref_name("main")).await.unwrap();
    assert_eq!(read.get::<Leaf>().unwrap().value, b"just a leaf");
}
