mod common;

use common::{named_item, reopen, setup_test_store, store_path, CHEST};
use worldstore::config::StoreConfig;
use worldstore::store::backup::{BackupKind, BackupManager};
use worldstore::store::dump::StoreDump;
use worldstore::store::schema::Category;
use worldstore::store::{Serial, StoreError, WorldStore, WorldStoreBuilder};

#[test]
fn disabled_store_accepts_everything_and_does_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = store_path(&dir);
    let mut store = WorldStoreBuilder::new(&path).enabled(false).open().unwrap();
    assert!(!store.is_enabled());
    assert!(store.path().is_none());

    let mut world = common::world();
    let boot = store.boot(&mut world).unwrap();
    assert!(boot.areas.is_empty());
    assert!(!boot.floor.raised);

    let chest = named_item(&mut world, CHEST, "chest");
    let serial = chest.serial;
    world.insert_root_item("bank", chest).unwrap();
    assert!(store.commit(&mut world).unwrap().is_noop());
    // Nothing was written, so the object is still dirty.
    assert!(world.get(serial).unwrap().flags().dirty);

    assert_eq!(store.load_root(&mut world, "bank", "chest").unwrap(), None);
    assert!(store.search_area(&mut world, "bank", "Name = 'chest'").unwrap().is_empty());
    assert!(!store.serial_exists(Category::Storage, serial).unwrap());
    assert!(!store.area_exists("bank").unwrap());
    store.begin_transaction().unwrap();
    assert_eq!(store.end_transaction(&mut world).unwrap(), 0);
    store.rollback_transaction(&mut world).unwrap();
    assert_eq!(store.export_dump().unwrap().records(), 0);
    assert_eq!(store.import_dump(&StoreDump::default()).unwrap().records(), 0);
    assert!(matches!(store.begin_import(), Err(StoreError::Disabled)));
    store.backup_to(&dir.path().join("snap.db")).unwrap();
    assert!(!dir.path().join("snap.db").exists());
    assert!(store.status().unwrap().path.is_none());
    store.close().unwrap();

    assert!(!path.exists());
}

#[test]
fn second_open_of_the_same_file_is_refused() {
    let (store, dir) = setup_test_store();
    match WorldStoreBuilder::new(store_path(&dir)).open() {
        Err(StoreError::StoreLocked(path)) => assert_eq!(path, store_path(&dir)),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("second open succeeded"),
    }
    store.close().unwrap();
    // Closing releases the lock.
    reopen(&dir).close().unwrap();
}

#[test]
fn from_config_honors_the_store_section() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        data_path: dir.path().join("world").to_string_lossy().into_owned(),
        file_name: "objects.db".to_string(),
        ..StoreConfig::default()
    };
    let store = WorldStore::from_config(&config).unwrap();
    assert_eq!(store.path(), Some(config.database_path().as_path()));
    assert!(dir.path().join("world").join("objects.db").exists());
    store.close().unwrap();

    let disabled = StoreConfig {
        enabled: false,
        ..config
    };
    assert!(!WorldStore::from_config(&disabled).unwrap().is_enabled());
}

/// Write a storage row whose container does not exist, bypassing foreign keys.
fn plant_dangling_row(path: &std::path::Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "PRAGMA foreign_keys = OFF;
         INSERT INTO storage_area (AreaId, Name) VALUES (1, 'bank');
         INSERT INTO storage_main (Serial, AreaId, Name, ObjType, Graphic, X, Y, Z, Realm, Revision, Container)
         VALUES (1073741825, 1, 'gem', 3648, 3648, 0, 0, 0, 'britannia', 0, 1073741977);",
    )
    .unwrap();
}

#[test]
fn integrity_check_on_open() {
    let (store, dir) = setup_test_store();
    store.close().unwrap();
    let path = store_path(&dir);
    plant_dangling_row(&path);

    match WorldStoreBuilder::new(&path).open() {
        Err(err) => assert!(err.is_integrity(), "{err}"),
        Ok(_) => panic!("dangling container passed the integrity check"),
    }

    let lenient = WorldStoreBuilder::new(&path)
        .ignore_load_errors(true)
        .open()
        .unwrap();
    lenient.close().unwrap();

    let unchecked = WorldStoreBuilder::new(&path)
        .check_integrity(false)
        .open()
        .unwrap();
    assert!(unchecked.serial_exists(Category::Storage, Serial(0x4000_0001)).unwrap());
}

#[test]
fn status_counts_records_per_area() {
    let (mut store, _dir) = setup_test_store();
    let mut world = common::world();
    store.boot(&mut world).unwrap();
    for (area, name) in [("bank", "chest"), ("bank", "crate"), ("house", "table")] {
        let item = named_item(&mut world, CHEST, name);
        world.insert_root_item(area, item).unwrap();
    }
    let chr = world.new_character("Avatar", "acct", 0).unwrap();
    world.add_character(chr).unwrap();
    store.commit(&mut world).unwrap();

    let status = store.status().unwrap();
    assert_eq!(status.storage, 3);
    assert_eq!(status.pcs, 1);
    assert_eq!(status.pcequip, 0);
    let counts: Vec<(String, i64)> = status
        .areas
        .iter()
        .map(|a| (a.name.clone(), a.records))
        .collect();
    assert_eq!(
        counts,
        vec![("bank".to_string(), 2), ("house".to_string(), 1)]
    );
    assert_eq!(status.floor.characters, Some(Serial(1)));
}

#[test]
fn snapshot_archive_and_restore() {
    let (mut store, dir) = setup_test_store();
    let mut world = common::world();
    store.boot(&mut world).unwrap();
    let chest = named_item(&mut world, CHEST, "chest");
    let chest_serial = chest.serial;
    world.insert_root_item("bank", chest).unwrap();
    store.commit(&mut world).unwrap();

    let mut manager = BackupManager::new(dir.path().join("backups"), 2).unwrap();
    let staging = manager.staging_path();
    store.backup_to(&staging).unwrap();
    let meta = manager
        .create_backup(&staging, Some("nightly".to_string()), BackupKind::Manual)
        .unwrap();
    assert!(manager.verify_backup(&meta.id).unwrap());

    // Lose the chest after the snapshot.
    world.destroy(chest_serial).unwrap();
    store.commit(&mut world).unwrap();
    assert!(!store.root_exists("bank", "chest").unwrap());
    store.close().unwrap();

    manager.restore_backup(&meta.id, &store_path(&dir)).unwrap();
    let store = reopen(&dir);
    assert!(store.root_exists("bank", "chest").unwrap());
    let mut fresh = common::world();
    assert_eq!(
        store.load_root(&mut fresh, "bank", "chest").unwrap(),
        Some(chest_serial)
    );
}
