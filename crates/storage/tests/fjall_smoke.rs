#![cfg(feature = "fjall")]

use std::collections::HashSet;

use utxod_storage::fjall::{FjallOptions, FjallStore};
use utxod_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_smoke_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");

    let store = FjallStore::open(dir.path()).expect("open fjall");
    store.put(Column::Meta, b"key", b"value").expect("put");
    assert_eq!(
        store.get(Column::Meta, b"key").expect("get"),
        Some(b"value".to_vec())
    );

    store.put(Column::Utxo, b"prefix:1", b"a").expect("put prefix");
    store.put(Column::Utxo, b"prefix:2", b"b").expect("put prefix");
    store.put(Column::Meta, b"prefix:3", b"c").expect("put prefix");
    let mut keys = HashSet::new();
    for (key, value) in store.scan_prefix(Column::Utxo, b"prefix:").expect("scan") {
        keys.insert((key, value));
    }
    assert_eq!(
        keys,
        HashSet::from([
            (b"prefix:1".to_vec(), b"a".to_vec()),
            (b"prefix:2".to_vec(), b"b".to_vec()),
        ])
    );

    let mut batch = WriteBatch::new();
    batch.put(Column::Meta, b"batch", b"ok");
    batch.delete(Column::Meta, b"key");
    store.write_batch(&batch).expect("batch commit");

    assert!(store.get(Column::Meta, b"key").expect("get").is_none());
    assert_eq!(
        store.get(Column::Meta, b"batch").expect("get"),
        Some(b"ok".to_vec())
    );
}

#[test]
fn fjall_reopen_keeps_synced_batches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let options = FjallOptions {
        sync_writes: true,
        ..FjallOptions::default()
    };
    {
        let store = FjallStore::open_with_options(dir.path(), options.clone()).expect("open");
        let mut batch = WriteBatch::new();
        batch.put(Column::BlockIndex, [7u8; 32], b"entry".to_vec());
        store.write_batch(&batch).expect("commit");
        store.persist().expect("persist");
    }
    let store = FjallStore::open_with_options(dir.path(), options).expect("reopen");
    assert_eq!(
        store.get(Column::BlockIndex, &[7u8; 32]).expect("get"),
        Some(b"entry".to_vec())
    );
}
