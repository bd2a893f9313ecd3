//! Shared helpers for integration tests.
//! Each test gets its own store file under a temporary directory so runs never
//! share state or contend for the store lock.
use tempfile::TempDir;
use worldstore::store::objects::{Item, ItemDescriptor, TypeCatalog};
use worldstore::store::{World, WorldStore, WorldStoreBuilder};

#[allow(dead_code)]
pub const CHEST: u32 = 0x0E40;
#[allow(dead_code)]
pub const COIN: u32 = 0x0EED;
#[allow(dead_code)]
pub const SWORD: u32 = 0x0F5E;

/// Catalog with a few registered types. Coins are not movable by default so the
/// default-suppression path has something to compare against.
#[allow(dead_code)]
pub fn catalog() -> TypeCatalog {
    let mut catalog = TypeCatalog::new();
    catalog.register(ItemDescriptor {
        name: "chest".to_string(),
        ..ItemDescriptor::generic(CHEST)
    });
    catalog.register(ItemDescriptor {
        name: "gold coin".to_string(),
        movable: false,
        ..ItemDescriptor::generic(COIN)
    });
    catalog.register(ItemDescriptor {
        name: "longsword".to_string(),
        max_hp: 40,
        ..ItemDescriptor::generic(SWORD)
    });
    catalog
}

#[allow(dead_code)]
pub fn world() -> World {
    World::new(catalog())
}

/// Store file path inside `dir`.
#[allow(dead_code)]
pub fn store_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("data").join("storage.db")
}

/// Open a fresh store in a temp dir. Keep the `TempDir` alive for the test's duration.
#[allow(dead_code)]
pub fn setup_test_store() -> (WorldStore, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = WorldStoreBuilder::new(store_path(&dir))
        .open()
        .expect("open store");
    (store, dir)
}

/// Reopen the store file in `dir` after the previous handle was closed.
#[allow(dead_code)]
pub fn reopen(dir: &TempDir) -> WorldStore {
    WorldStoreBuilder::new(store_path(dir))
        .open()
        .expect("reopen store")
}

/// A new item of `objtype` with a fresh serial, renamed to `name`.
#[allow(dead_code)]
pub fn named_item(world: &mut World, objtype: u32, name: &str) -> Item {
    let mut item = world.new_item(objtype).expect("new item");
    item.name = name.to_string();
    item
}

/// A new item placed inside `container`.
#[allow(dead_code)]
pub fn item_in(world: &mut World, objtype: u32, name: &str, container: worldstore::store::Serial) -> worldstore::store::Serial {
    let mut item = named_item(world, objtype, name);
    item.container = Some(container);
    let serial = item.serial;
    world.attach(item).expect("attach");
    serial
}
