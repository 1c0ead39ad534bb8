mod common;

use std::sync::Arc;
use std::time::Duration;

use arbor_bundle::BundleError;
use arbor_storage::{InMemoryBackend, RefOptions, StorageBackend};
use arbor_tree::{NodeRegistry, ReaderOptions, StorageClient, StorageConfig, StorageError};
use arbor_types::NodeHandle;
use bytes::Bytes;
use futures::future::join_all;

use common::{branch, client, leaf, ref_name, Branch, Leaf, TestBackend};

fn prefetch(bytes: usize) -> StorageConfig {
    StorageConfig {
        reader: ReaderOptions {
            header_prefetch_size: bytes,
            ..ReaderOptions::default()
        },
        ..StorageConfig::default()
    }
}

/// Write a root with `count` distinct leaves and return the leaf handles.
async fn write_leaves(client: &StorageClient, count: usize) -> Vec<NodeHandle> {
    let children = (0..count).map(|i| leaf(&format!("leaf-{i}"))).collect();
    let mut root = branch("root", children);
    client
        .write_tree(&ref_name("main"), &mut root, RefOptions::default())
        .await
        .unwrap();
    root.get::<Branch>()
        .unwrap()
        .children
        .iter()
        .map(|child| child.handle().unwrap().clone())
        .collect()
}

#[tokio::test]
async fn corrupt_signature_is_a_format_error() {
    let backend = Arc::new(InMemoryBackend::new());
    let blob = backend
        .write_blob(Bytes::from_static(b"NOPE\0\0\0\x10not a bundle"), None)
        .await
        .unwrap();
    let client = client(backend, StorageConfig::default());

    for _ in 0..2 {
        let err = client.reader().read_node_data(&blob.node(0)).await.unwrap_err();
        assert!(
            matches!(err, StorageError::Format(BundleError::InvalidSignature { .. })),
            "{err}"
        );
    }
    // Failed headers are not cached.
    assert_eq!(client.reader().stats().header_reads, 2);
}

#[tokio::test]
async fn header_larger_than_prefetch_is_read_twice_once() {
    let backend = Arc::new(InMemoryBackend::new());
    let writer = client(backend.clone(), StorageConfig::default());
    let handles = write_leaves(&writer, 50).await;

    let reader = client(backend, prefetch(16));
    let node = reader.read_node(&handles[17]).await.unwrap();
    assert_eq!(node.as_any().downcast_ref::<Leaf>().unwrap().value, b"leaf-17");
    reader.read_node(&handles[3]).await.unwrap();

    let stats = reader.reader().stats();
    assert_eq!(stats.header_reads, 1);
    assert_eq!(stats.second_header_reads, 1);
    assert_eq!(stats.header_hits, 1);
}

#[tokio::test]
async fn concurrent_reads_share_one_fetch() {
    let backend = Arc::new(TestBackend::new());
    let writer = client(backend.clone(), StorageConfig::default());
    let handles = write_leaves(&writer, 8).await;

    let reader = client(backend.clone(), prefetch(8));
    let before = backend.range_reads();
    let nodes = join_all(handles.iter().map(|handle| reader.read_node(handle))).await;
    for (i, node) in nodes.into_iter().enumerate() {
        let node = node.unwrap();
        let leaf = node.as_any().downcast_ref::<Leaf>().unwrap();
        assert_eq!(leaf.value, format!("leaf-{i}").into_bytes());
    }

    let stats = reader.reader().stats();
    assert_eq!(stats.header_reads, 1);
    assert_eq!(stats.second_header_reads, 1);
    assert_eq!(stats.packet_reads, 1);
    assert!(stats.coalesced >= 7, "{stats:?}");
    // Prefix, full header, packets.
    assert_eq!(backend.range_reads() - before, 3);
}

#[tokio::test]
async fn unregistered_node_type_is_a_consistency_error() {
    let backend = Arc::new(InMemoryBackend::new());
    let writer = client(backend.clone(), StorageConfig::default());
    let handles = write_leaves(&writer, 2).await;

    let leaves_only = StorageClient::new(
        backend,
        NodeRegistry::new().with::<Leaf>(),
        StorageConfig::default(),
    )
    .unwrap();
    leaves_only.read_node(&handles[0]).await.unwrap();
    assert!(matches!(
        leaves_only.read_tree::<Branch>(&ref_name("main")).await,
        Err(StorageError::Consistency(_))
    ));
}

#[tokio::test]
async fn abandoned_read_does_not_strand_a_shared_fetch() {
    let backend = Arc::new(TestBackend::new());
    let writer = client(backend.clone(), StorageConfig::default());
    let handles = write_leaves(&writer, 2).await;
    let locators: Vec<_> = handles.iter().map(|h| h.locator().unwrap()).collect();

    let client = client(backend.clone(), StorageConfig::default());
    backend.close_read_gate();
    let spawn_read = |index: usize| {
        let reader = client.reader().clone();
        let locator = locators[index].clone();
        tokio::spawn(async move { reader.read_node_data(&locator).await.map(|data| data.hash) })
    };
    let abandoned = spawn_read(0);
    let survivor = spawn_read(1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());

    backend.open_read_gate();
    assert_eq!(survivor.await.unwrap().unwrap(), handles[1].hash());

    let stats = client.reader().stats();
    assert_eq!(stats.header_reads, 1);
    assert_eq!(stats.packet_reads, 1);
}
