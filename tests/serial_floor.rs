mod common;

use common::{named_item, reopen, setup_test_store, CHEST};
use worldstore::store::serial::{SerialAllocator, SerialKind};
use worldstore::store::Serial;

#[test]
fn boot_raises_floor_above_everything_persisted() {
    let (mut store, dir) = setup_test_store();
    let mut world = common::world();
    // Start well above the allocator's base so the raise is observable.
    world.allocator.raise_floor(Serial(0x4000_0500));
    world.allocator.raise_floor(Serial(40));
    let chest = named_item(&mut world, CHEST, "chest");
    let chest_serial = chest.serial;
    world.insert_root_item("bank", chest).unwrap();
    let chr = world.new_character("Avatar", "acct", 0).unwrap();
    let chr_serial = chr.serial;
    world.add_character(chr).unwrap();
    let mut sword = named_item(&mut world, CHEST, "sword");
    sword.container = Some(chr_serial);
    sword.layer = 1;
    let sword_serial = sword.serial;
    world.attach(sword).unwrap();
    store.commit(&mut world).unwrap();
    store.close().unwrap();

    let mut store = reopen(&dir);
    let mut world = common::world();
    let boot = store.boot(&mut world).unwrap();
    assert!(boot.floor.raised);
    assert_eq!(boot.floor.storage_items, Some(chest_serial));
    assert_eq!(boot.floor.characters, Some(chr_serial));
    assert_eq!(boot.floor.equipped_items, Some(sword_serial));
    assert_eq!(boot.floor.held_items, None);
    assert_eq!(boot.areas, vec!["bank".to_string()]);
    assert!(world.area("bank").is_some());

    // No resident object yet, but fresh serials still clear the stored ones.
    let next_item = world.new_item(CHEST).unwrap().serial;
    assert!(next_item > sword_serial && next_item > chest_serial);
    let next_chr = world.new_character("Other", "acct", 1).unwrap().serial;
    assert!(next_chr > chr_serial);
}

#[test]
fn raising_is_idempotent_and_never_lowers() {
    let (mut store, _dir) = setup_test_store();
    let mut world = common::world();
    let chest = named_item(&mut world, CHEST, "chest");
    world.insert_root_item("bank", chest).unwrap();
    store.commit(&mut world).unwrap();

    let mut allocator = SerialAllocator::new();
    allocator.raise_floor(Serial(0x4100_0000));
    let before = allocator.high_water(SerialKind::Item);
    let report = store.raise_serial_floor(&mut allocator).unwrap();
    assert!(!report.raised);
    assert_eq!(allocator.high_water(SerialKind::Item), before);

    let mut fresh = SerialAllocator::new();
    assert!(store.raise_serial_floor(&mut fresh).unwrap().raised);
    let mark = fresh.high_water(SerialKind::Item);
    assert!(!store.raise_serial_floor(&mut fresh).unwrap().raised);
    assert_eq!(fresh.high_water(SerialKind::Item), mark);
}
