mod common;

use common::{item_in, named_item, setup_test_store, CHEST, COIN};
use worldstore::store::dump::StoreDump;
use worldstore::store::property::PropertySet;
use worldstore::store::schema::Category;
use worldstore::store::{Serial, StoreError, WorldStoreBuilder};

fn record(serial: u32, name: &str, container: Option<u32>) -> PropertySet {
    let mut set = PropertySet::new(Serial(serial));
    set.set_main("Name", name);
    set.set_main("ObjType", CHEST);
    set.set_main("Graphic", CHEST);
    set.set_main("X", 1420);
    set.set_main("Y", 1700);
    set.set_main("Z", 0);
    set.set_main("Realm", "britannia");
    set.set_main("Revision", 0);
    if let Some(c) = container {
        set.set_main("Container", c);
    }
    set
}

fn character(serial: u32, account: &str, index: u8) -> PropertySet {
    let mut set = record(serial, "Avatar", None);
    set.set_main("ObjType", 0x0190);
    set.set_main("Graphic", 0x0190);
    set.set_unusual("Account", account);
    set.set_unusual("CharIdx", index);
    set
}

#[test]
fn imported_records_load_like_committed_ones() {
    let (mut store, _dir) = setup_test_store();
    let mut importer = store.begin_import().unwrap();
    importer.declare_area("bank").unwrap();
    // Contents may precede their containers.
    assert!(importer
        .insert_storage("bank", &record(0x4000_0002, "bag", Some(0x4000_0001)))
        .unwrap());
    assert!(importer
        .insert_storage("bank", &record(0x4000_0001, "chest", None))
        .unwrap());
    assert!(importer.insert_character(&character(3, "acct", 0)).unwrap());
    let mut pack = record(0x4000_0010, "backpack", Some(3));
    pack.set_unusual("Layer", 21);
    assert!(importer.insert_equipped(&pack).unwrap());
    assert!(importer
        .insert_held(&record(0x4000_0011, "coin", Some(0x4000_0010)))
        .unwrap());
    let report = importer.finish().unwrap();
    assert_eq!(report.areas, 1);
    assert_eq!(report.storage, 2);
    assert_eq!(report.characters, 1);
    assert_eq!(report.equipped, 1);
    assert_eq!(report.held, 1);
    assert_eq!(report.records(), 5);
    assert_eq!(report.skipped, 0);

    let mut world = common::world();
    let boot = store.boot(&mut world).unwrap();
    assert_eq!(boot.floor.storage_items, Some(Serial(0x4000_0002)));
    assert_eq!(boot.floor.held_items, Some(Serial(0x4000_0011)));
    assert_eq!(
        store.load_root(&mut world, "bank", "chest").unwrap(),
        Some(Serial(0x4000_0001))
    );
    assert_eq!(world.contents(Serial(0x4000_0001)), &[Serial(0x4000_0002)]);
    assert_eq!(store.find_character(&mut world, "acct", 0).unwrap(), Some(Serial(3)));
    assert_eq!(world.item(Serial(0x4000_0010)).unwrap().layer, 21);
    assert_eq!(world.contents(Serial(0x4000_0010)), &[Serial(0x4000_0011)]);
    assert!(store.commit(&mut world).unwrap().is_noop());
}

#[test]
fn bad_records_abort_the_whole_import() {
    let (store, _dir) = setup_test_store();
    let mut importer = store.begin_import().unwrap();
    importer
        .insert_storage("bank", &record(0x4000_0001, "chest", None))
        .unwrap();
    let err = importer
        .insert_equipped(&record(0x4000_0002, "ring", Some(0x4000_0001)))
        .unwrap_err();
    assert!(err.is_integrity());
    drop(importer);

    assert_eq!(store.session().unwrap().count(Category::Storage).unwrap(), 0);
    assert!(store.list_areas().unwrap().is_empty());
    assert!(!store.session().unwrap().in_transaction());
}

#[test]
fn ignored_errors_skip_records_and_discard_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let store = WorldStoreBuilder::new(common::store_path(&dir))
        .ignore_load_errors(true)
        .open()
        .unwrap();
    let mut importer = store.begin_import().unwrap();
    importer
        .insert_storage("bank", &record(0x4000_0001, "chest", None))
        .unwrap();
    // Wrong serial kind for a character.
    assert!(!importer.insert_character(&record(0x4000_0005, "ghost", None)).unwrap());
    // Duplicate serial.
    assert!(!importer
        .insert_storage("bank", &record(0x4000_0001, "copy", None))
        .unwrap());
    // Container never arrives; its child goes with it.
    importer
        .insert_storage("bank", &record(0x4000_0003, "pouch", Some(0x4000_0099)))
        .unwrap();
    importer
        .insert_storage("bank", &record(0x4000_0004, "gem", Some(0x4000_0003)))
        .unwrap();
    let report = importer.finish().unwrap();
    assert_eq!(report.skipped, 2);
    assert_eq!(report.orphans_discarded, 2);
    assert_eq!(report.storage, 3);

    let session = store.session().unwrap();
    let serials: Vec<Serial> = session.list_serials(Category::Storage).unwrap().into_iter().collect();
    assert_eq!(serials, vec![Serial(0x4000_0001)]);
}

#[test]
fn zero_container_imports_as_a_root() {
    let (store, _dir) = setup_test_store();
    let mut importer = store.begin_import().unwrap();
    let mut chest = record(0x4000_0001, "chest", None);
    chest.set_main("Container", 0u32);
    assert_eq!(chest.container(), None);
    assert!(importer.insert_storage("bank", &chest).unwrap());
    let report = importer.finish().unwrap();
    assert_eq!(report.storage, 1);
    assert_eq!(report.orphans_discarded, 0);

    assert!(store.root_exists("bank", "chest").unwrap());
    let mut world = common::world();
    assert_eq!(
        store.load_root(&mut world, "bank", "chest").unwrap(),
        Some(Serial(0x4000_0001))
    );
    assert_eq!(world.item(Serial(0x4000_0001)).unwrap().container, None);
}

#[test]
fn invalid_area_names_are_rejected() {
    let (store, _dir) = setup_test_store();
    let mut importer = store.begin_import().unwrap();
    let err = importer.declare_area("").unwrap_err();
    assert!(matches!(err, StoreError::InvalidName(_)));
}

#[test]
fn dump_moves_a_store_between_files() {
    let (mut source, dir) = setup_test_store();
    let mut world = common::world();
    source.boot(&mut world).unwrap();
    let chest = named_item(&mut world, CHEST, "chest");
    let chest_serial = chest.serial;
    world.insert_root_item("bank", chest).unwrap();
    let coin = item_in(&mut world, COIN, "gold coin", chest_serial);
    world.item_mut(coin).unwrap().set_cprop("minted", "1999");
    let chr = world.new_character("Avatar", "acct", 2).unwrap();
    world.add_character(chr).unwrap();
    source.commit(&mut world).unwrap();

    let path = dir.path().join("world.json");
    let dump = source.export_dump().unwrap();
    assert_eq!(dump.records(), 3);
    dump.save(&path).unwrap();

    let target_dir = tempfile::tempdir().unwrap();
    let mut target = WorldStoreBuilder::new(common::store_path(&target_dir))
        .open()
        .unwrap();
    let loaded = StoreDump::load(&path).unwrap();
    let report = target.import_dump(&loaded).unwrap();
    assert_eq!(report.records(), 3);
    assert_eq!(report.areas, 1);

    let mut copy = common::world();
    target.boot(&mut copy).unwrap();
    target.load_root(&mut copy, "bank", "chest").unwrap();
    assert_eq!(copy.item(chest_serial), world.item(chest_serial));
    assert_eq!(copy.item(coin), world.item(coin));
    let found = target.find_character(&mut copy, "acct", 2).unwrap().unwrap();
    assert_eq!(copy.character(found), world.character(found));
}
