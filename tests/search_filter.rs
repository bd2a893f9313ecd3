mod common;

use common::{item_in, named_item, setup_test_store, CHEST, COIN};
use worldstore::store::{Serial, StoreError, WorldStore};

struct Bank {
    chest: Serial,
    gold: Serial,
    silver: Serial,
    crate_: Serial,
}

fn stocked_bank(store: &mut WorldStore) -> Bank {
    let mut world = common::world();
    store.boot(&mut world).unwrap();
    let chest = named_item(&mut world, CHEST, "chest");
    let chest_serial = chest.serial;
    world.insert_root_item("bank", chest).unwrap();
    let gold = item_in(&mut world, COIN, "gold coin", chest_serial);
    let silver = item_in(&mut world, COIN, "silver coin", chest_serial);
    {
        let item = world.item_mut(gold).unwrap();
        item.amount = 500;
        item.set_cprop("CraftLevel", "17");
    }
    {
        let item = world.item_mut(silver).unwrap();
        item.amount = 20;
        item.set_cprop("CraftLevel", "9");
    }
    let mut crate_ = named_item(&mut world, CHEST, "crate");
    crate_.set_cprop("owner", "O'Brien");
    let crate_serial = crate_.serial;
    world.insert_root_item("house", crate_).unwrap();
    store.commit(&mut world).unwrap();
    Bank {
        chest: chest_serial,
        gold,
        silver,
        crate_: crate_serial,
    }
}

#[test]
fn matches_load_through_their_owner() {
    let (mut store, _dir) = setup_test_store();
    let bank = stocked_bank(&mut store);

    let mut world = common::world();
    let found = store
        .search_area(&mut world, "bank", "Name like '%coin' && Amount > 100")
        .unwrap();
    assert_eq!(found, vec![bank.gold]);
    // The whole root came in, not just the match.
    assert!(world.contains(bank.chest));
    assert!(world.contains(bank.silver));
    assert!(!world.contains(bank.crate_));
}

#[test]
fn custom_properties_compare_numerically() {
    let (mut store, _dir) = setup_test_store();
    let bank = stocked_bank(&mut store);
    let mut world = common::world();

    assert_eq!(
        store.search_area(&mut world, "bank", "CraftLevel < 10").unwrap(),
        vec![bank.silver]
    );
    assert_eq!(
        store
            .search_area(&mut world, "bank", "int(CraftLevel) >= 0x11 or Name = 'chest'")
            .unwrap(),
        vec![bank.chest, bank.gold]
    );
}

#[test]
fn search_stays_inside_its_area() {
    let (mut store, _dir) = setup_test_store();
    let bank = stocked_bank(&mut store);
    let mut world = common::world();

    assert!(store
        .search_area(&mut world, "bank", "owner = \"O'Brien\"")
        .unwrap()
        .is_empty());
    assert_eq!(
        store
            .search_area(&mut world, "house", "owner = \"O'Brien\"")
            .unwrap(),
        vec![bank.crate_]
    );
    assert!(store
        .search_area(&mut world, "nowhere", "Name = 'chest'")
        .unwrap()
        .is_empty());
}

#[test]
fn hostile_text_is_only_ever_a_value() {
    let (mut store, _dir) = setup_test_store();
    stocked_bank(&mut store);
    let mut world = common::world();

    let found = store
        .search_area(&mut world, "bank", "Name = \"x' OR 1=1; DROP TABLE storage_main; --\"")
        .unwrap();
    assert!(found.is_empty());
    assert_eq!(store.list_areas().unwrap().len(), 2);
    assert!(store.root_exists("bank", "chest").unwrap());
}

#[test]
fn malformed_predicates_are_rejected() {
    let (mut store, _dir) = setup_test_store();
    stocked_bank(&mut store);
    let mut world = common::world();

    for text in ["", "Name ==", "(Name = 'a'", "1 = 1", "Name = 'open"] {
        let err = store.search_area(&mut world, "bank", text).unwrap_err();
        assert!(
            matches!(err, StoreError::InvalidFilter(_)),
            "{text:?} gave {err:?}"
        );
    }
    assert!(world.is_empty());
}
