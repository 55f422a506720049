//! Fixture packs and small harness pieces shared across the cache tests.

use pakrat_format::ArchiveWriter;
use pakrat_format::ManifestWriter;
use pakrat_format::MANIFEST_BUNDLE;
use std::cell::Cell;
use std::fs;
use std::rc::Rc;
use std::task::RawWaker;
use std::task::RawWakerVTable;
use std::task::Waker;
use tempfile::TempDir;

use crate::FileResolver;

pub fn pack_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// Every id maps to a file of the same name inside the pack directory.
pub fn resolver_for(dir: &TempDir) -> FileResolver {
    let root = dir.path().to_path_buf();
    Box::new(move |id: &str| root.join(id))
}

/// Like [`resolver_for`], counting calls. The managers resolve a path once
/// per record they create, so the count observes underlying load operations.
pub fn counting_resolver_for(dir: &TempDir) -> (FileResolver, Rc<Cell<usize>>) {
    let count = Rc::new(Cell::new(0));
    let observed = count.clone();
    let root = dir.path().to_path_buf();
    let resolver: FileResolver = Box::new(move |id: &str| {
        observed.set(observed.get() + 1);
        root.join(id)
    });
    (resolver, count)
}

fn write_archive(
    dir: &TempDir,
    name: &str,
    writer: ArchiveWriter,
    offset: usize,
) {
    let mut bytes = vec![0xab_u8; offset];
    bytes.extend_from_slice(&writer.into_bytes().unwrap());
    fs::write(dir.path().join(name), bytes).unwrap();
}

/// Writes one bundle archive, padded in front by `offset` junk bytes.
pub fn write_bundle<T: AsRef<[u8]>>(
    dir: &TempDir,
    name: &str,
    entries: &[(&str, T)],
    offset: usize,
) {
    let mut writer = ArchiveWriter::new();
    for (entry_name, data) in entries {
        writer.add_entry(entry_name, data.as_ref().to_vec());
    }
    write_archive(dir, name, writer, offset);
}

pub fn write_loose(
    dir: &TempDir,
    name: &str,
    bytes: &[u8],
) {
    fs::write(dir.path().join(name), bytes).unwrap();
}

fn write_manifest(
    dir: &TempDir,
    manifest: &ManifestWriter,
    offset: usize,
) {
    let mut root = ArchiveWriter::new();
    manifest.write(&mut root).unwrap();
    write_archive(dir, MANIFEST_BUNDLE, root, offset);
}

/// The standard fixture: bundle1 holds Hero, which depends on Arm and Leg,
/// both packed into bundle2.
pub fn hero_pack() -> TempDir {
    hero_pack_with_offset(0)
}

pub fn hero_pack_with_offset(offset: usize) -> TempDir {
    let dir = pack_dir();

    let mut manifest = ManifestWriter::new();
    manifest.add_bundle("bundle1", &["Hero"]).unwrap();
    manifest.add_bundle("bundle2", &["Arm", "Leg"]).unwrap();
    manifest.set_dependencies("Hero", &["Arm", "Leg"]).unwrap();
    write_manifest(&dir, &manifest, offset);

    write_bundle(&dir, "bundle1", &[("Hero", b"hero payload" as &[u8])], offset);
    write_bundle(
        &dir,
        "bundle2",
        &[
            ("Arm", b"arm payload" as &[u8]),
            ("Leg", b"leg payload" as &[u8]),
        ],
        offset,
    );
    dir
}

/// A pack whose manifest promises the asset Ghost in bundle1, while the
/// archive on disk never packed it.
pub fn pack_with_unpacked_ghost() -> TempDir {
    let dir = pack_dir();

    let mut manifest = ManifestWriter::new();
    manifest.add_bundle("bundle1", &["Hero", "Ghost"]).unwrap();
    write_manifest(&dir, &manifest, 0);

    write_bundle(&dir, "bundle1", &[("Hero", b"hero payload" as &[u8])], 0);
    dir
}

/// Assets chained two deep: Sword depends on Hilt, which depends on Gem.
/// Sword sits alone in bundle_a; Hilt and Gem share bundle_b.
pub fn deep_pack() -> TempDir {
    let dir = pack_dir();

    let mut manifest = ManifestWriter::new();
    manifest.add_bundle("bundle_a", &["Sword"]).unwrap();
    manifest.add_bundle("bundle_b", &["Hilt", "Gem"]).unwrap();
    manifest.set_dependencies("Sword", &["Hilt"]).unwrap();
    manifest.set_dependencies("Hilt", &["Gem"]).unwrap();
    write_manifest(&dir, &manifest, 0);

    write_bundle(&dir, "bundle_a", &[("Sword", b"sword payload" as &[u8])], 0);
    write_bundle(
        &dir,
        "bundle_b",
        &[
            ("Hilt", b"hilt payload" as &[u8]),
            ("Gem", b"gem payload" as &[u8]),
        ],
        0,
    );
    dir
}

/// A pack with a container-to-container edge: Blade lives in `weapons`,
/// which depends on the `common` container.
pub fn chained_pack() -> TempDir {
    let dir = pack_dir();

    let mut manifest = ManifestWriter::new();
    manifest.add_bundle("weapons", &["Blade"]).unwrap();
    manifest.add_bundle("common", &["Hilt"]).unwrap();
    manifest.set_bundle_dependencies("weapons", &["common"]).unwrap();
    write_manifest(&dir, &manifest, 0);

    write_bundle(&dir, "weapons", &[("Blade", b"blade payload" as &[u8])], 0);
    write_bundle(&dir, "common", &[("Hilt", b"hilt payload" as &[u8])], 0);
    dir
}

pub fn noop_waker() -> Waker {
    fn raw_waker() -> RawWaker {
        fn clone(_: *const ()) -> RawWaker {
            raw_waker()
        }
        fn no_op(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    // SAFETY: every vtable entry ignores its data pointer
    unsafe { Waker::from_raw(raw_waker()) }
}
