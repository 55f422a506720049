//! The manifest tables the packaging pipeline hands to the runtime.
//!
//! The manifest is itself a PAKR archive with a fixed id, resolved through the
//! host's file callback like any other container. Three entries are mandatory,
//! one is optional:
//!
//! - `resources.bin`: u16 asset count, then one string per asset. The asset's
//!   index is its position.
//! - `bundles.bin`: u16 bundle count, then per bundle a string id, a u16 asset
//!   count, and that many u16 asset indices packed into the bundle.
//! - `dependencies.bin`: u16 record count, then per record a u16 entry count
//!   (including the subject), and that many u16 asset indices where index 0 is
//!   the subject and the rest its direct dependencies.
//! - `bundle_dependencies.bin` (optional): same record shape over bundle
//!   indices. Absent means no container-level dependencies.

use bytes::Bytes;
use fnv::{FnvHashMap, FnvHashSet};
use std::sync::Arc;

use crate::archive::{write_str, ArchiveWriter, PakArchive};
use crate::reader::ByteReader;
use crate::{PakratError, PakratResult};

/// Fixed id of the container holding the manifest tables.
pub const MANIFEST_BUNDLE: &str = "manifest.pak";

pub const ASSET_TABLE: &str = "resources.bin";
pub const BUNDLE_TABLE: &str = "bundles.bin";
pub const DEPENDENCY_TABLE: &str = "dependencies.bin";
pub const BUNDLE_DEPENDENCY_TABLE: &str = "bundle_dependencies.bin";

/// Parsed, validated dependency tables. Read-only after load.
pub struct PackManifest {
    assets: Vec<Arc<str>>,
    bundles: Vec<Arc<str>>,
    asset_bundle: FnvHashMap<Arc<str>, Arc<str>>,
    asset_dependencies: FnvHashMap<Arc<str>, Vec<Arc<str>>>,
    bundle_dependencies: FnvHashMap<Arc<str>, Vec<Arc<str>>>,
}

impl PackManifest {
    pub fn parse(archive: &PakArchive) -> PakratResult<PackManifest> {
        let assets = parse_asset_table(&required_entry(archive, ASSET_TABLE)?)?;
        let (bundles, asset_bundle) =
            parse_bundle_table(&required_entry(archive, BUNDLE_TABLE)?, &assets)?;
        let asset_dependencies =
            parse_dependency_table(&required_entry(archive, DEPENDENCY_TABLE)?, &assets)?;
        let bundle_dependencies = match archive.entry(BUNDLE_DEPENDENCY_TABLE) {
            Some(data) => parse_bundle_dependency_table(&data, &bundles)?,
            None => FnvHashMap::default(),
        };

        for asset in &assets {
            if !asset_bundle.contains_key(asset) {
                return Err(PakratError::Configuration(format!(
                    "asset {:?} is not packed into any bundle",
                    asset
                )));
            }
        }

        check_acyclic(&assets, &asset_dependencies, "asset")?;
        check_acyclic(&bundles, &bundle_dependencies, "bundle")?;

        log::debug!(
            "manifest loaded: {} assets, {} bundles, {} asset dependency edges, {} bundle dependency edges",
            assets.len(),
            bundles.len(),
            asset_dependencies.values().map(|d| d.len()).sum::<usize>(),
            bundle_dependencies.values().map(|d| d.len()).sum::<usize>()
        );

        Ok(PackManifest {
            assets,
            bundles,
            asset_bundle,
            asset_dependencies,
            bundle_dependencies,
        })
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    pub fn bundle_count(&self) -> usize {
        self.bundles.len()
    }

    pub fn contains_asset(
        &self,
        asset_id: &str,
    ) -> bool {
        self.asset_bundle.contains_key(asset_id)
    }

    /// The bundle an asset is packed into.
    pub fn bundle_for_asset(
        &self,
        asset_id: &str,
    ) -> Option<&Arc<str>> {
        self.asset_bundle.get(asset_id)
    }

    /// Direct dependencies of an asset; empty for assets without a record.
    pub fn asset_dependencies(
        &self,
        asset_id: &str,
    ) -> &[Arc<str>] {
        self.asset_dependencies
            .get(asset_id)
            .map(|deps| deps.as_slice())
            .unwrap_or(&[])
    }

    /// Direct dependency bundles of a bundle; usually empty.
    pub fn bundle_dependencies(
        &self,
        bundle_id: &str,
    ) -> &[Arc<str>] {
        self.bundle_dependencies
            .get(bundle_id)
            .map(|deps| deps.as_slice())
            .unwrap_or(&[])
    }

    /// Clone of the container dependency map, for handing to the container
    /// cache at startup.
    pub fn bundle_dependency_map(&self) -> FnvHashMap<Arc<str>, Vec<Arc<str>>> {
        self.bundle_dependencies.clone()
    }
}

fn required_entry(
    archive: &PakArchive,
    name: &str,
) -> PakratResult<Bytes> {
    archive.entry(name).ok_or_else(|| {
        PakratError::Configuration(format!("manifest archive is missing entry {:?}", name))
    })
}

fn parse_asset_table(data: &[u8]) -> PakratResult<Vec<Arc<str>>> {
    let mut reader = ByteReader::new(data, "asset table");
    let count = reader.read_u16()?;

    let mut assets = Vec::with_capacity(count as usize);
    let mut seen = FnvHashSet::default();
    for _ in 0..count {
        let id: Arc<str> = Arc::from(reader.read_str()?);
        if !seen.insert(id.clone()) {
            return Err(PakratError::Configuration(format!(
                "duplicate asset id {:?}",
                id
            )));
        }
        assets.push(id);
    }

    reader.expect_end()?;
    Ok(assets)
}

fn parse_bundle_table(
    data: &[u8],
    assets: &[Arc<str>],
) -> PakratResult<(Vec<Arc<str>>, FnvHashMap<Arc<str>, Arc<str>>)> {
    let mut reader = ByteReader::new(data, "bundle table");
    let count = reader.read_u16()?;

    let mut bundles = Vec::with_capacity(count as usize);
    let mut asset_bundle = FnvHashMap::default();
    let mut seen = FnvHashSet::default();
    for _ in 0..count {
        let bundle: Arc<str> = Arc::from(reader.read_str()?);
        if !seen.insert(bundle.clone()) {
            return Err(PakratError::Configuration(format!(
                "duplicate bundle id {:?}",
                bundle
            )));
        }

        let asset_count = reader.read_u16()?;
        for _ in 0..asset_count {
            let asset = indexed(assets, reader.read_u16()?, "bundle table", "asset")?;
            if asset_bundle.insert(asset.clone(), bundle.clone()).is_some() {
                return Err(PakratError::Configuration(format!(
                    "asset {:?} is listed in more than one bundle",
                    asset
                )));
            }
        }
        bundles.push(bundle);
    }

    reader.expect_end()?;
    Ok((bundles, asset_bundle))
}

fn parse_dependency_table(
    data: &[u8],
    assets: &[Arc<str>],
) -> PakratResult<FnvHashMap<Arc<str>, Vec<Arc<str>>>> {
    let mut reader = ByteReader::new(data, "dependency table");
    let count = reader.read_u16()?;

    let mut dependencies = FnvHashMap::default();
    for _ in 0..count {
        let total = reader.read_u16()?;
        if total == 0 {
            return Err(PakratError::Configuration(
                "dependency record with zero entries".to_string(),
            ));
        }

        let subject = indexed(assets, reader.read_u16()?, "dependency table", "asset")?;
        let mut deps = Vec::with_capacity(total as usize - 1);
        for _ in 1..total {
            deps.push(indexed(
                assets,
                reader.read_u16()?,
                "dependency table",
                "asset",
            )?);
        }

        if dependencies.insert(subject.clone(), deps).is_some() {
            return Err(PakratError::Configuration(format!(
                "duplicate dependency record for asset {:?}",
                subject
            )));
        }
    }

    reader.expect_end()?;
    Ok(dependencies)
}

fn parse_bundle_dependency_table(
    data: &[u8],
    bundles: &[Arc<str>],
) -> PakratResult<FnvHashMap<Arc<str>, Vec<Arc<str>>>> {
    let mut reader = ByteReader::new(data, "bundle dependency table");
    let count = reader.read_u16()?;

    let mut dependencies = FnvHashMap::default();
    for _ in 0..count {
        let total = reader.read_u16()?;
        if total == 0 {
            return Err(PakratError::Configuration(
                "bundle dependency record with zero entries".to_string(),
            ));
        }

        let subject = indexed(
            bundles,
            reader.read_u16()?,
            "bundle dependency table",
            "bundle",
        )?;
        let mut deps = Vec::with_capacity(total as usize - 1);
        for _ in 1..total {
            deps.push(indexed(
                bundles,
                reader.read_u16()?,
                "bundle dependency table",
                "bundle",
            )?);
        }

        if dependencies.insert(subject.clone(), deps).is_some() {
            return Err(PakratError::Configuration(format!(
                "duplicate bundle dependency record for {:?}",
                subject
            )));
        }
    }

    reader.expect_end()?;
    Ok(dependencies)
}

fn indexed(
    ids: &[Arc<str>],
    index: u16,
    table: &str,
    kind: &str,
) -> PakratResult<Arc<str>> {
    ids.get(index as usize).cloned().ok_or_else(|| {
        PakratError::Configuration(format!(
            "{} references {} index {} but only {} exist",
            table,
            kind,
            index,
            ids.len()
        ))
    })
}

// Iterative three-color walk so a deep dependency chain cannot blow the stack.
fn check_acyclic(
    ids: &[Arc<str>],
    edges: &FnvHashMap<Arc<str>, Vec<Arc<str>>>,
    what: &str,
) -> PakratResult<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Open,
        Done,
    }

    let mut marks: FnvHashMap<&str, Mark> = ids.iter().map(|id| (&**id, Mark::New)).collect();

    for start in ids {
        if marks[&**start] != Mark::New {
            continue;
        }

        let mut stack: Vec<(&str, usize)> = vec![(&**start, 0)];
        *marks.get_mut(&**start).unwrap() = Mark::Open;
        while let Some((id, next_child)) = stack.last_mut() {
            let deps = edges.get(*id).map(|deps| deps.as_slice()).unwrap_or(&[]);
            if *next_child < deps.len() {
                let child = &*deps[*next_child];
                *next_child += 1;
                match marks[child] {
                    Mark::New => {
                        *marks.get_mut(child).unwrap() = Mark::Open;
                        stack.push((child, 0));
                    }
                    Mark::Open => {
                        return Err(PakratError::Configuration(format!(
                            "cyclic {} dependency involving {:?}",
                            what, child
                        )));
                    }
                    Mark::Done => {}
                }
            } else {
                *marks.get_mut(*id).unwrap() = Mark::Done;
                stack.pop();
            }
        }
    }

    Ok(())
}

/// Builds manifest tables from id-level input, assigning indices internally.
/// The write side of the packaging contract; partitioning and dependency
/// collection stay with the pipeline.
#[derive(Default)]
pub struct ManifestWriter {
    assets: Vec<String>,
    asset_index: FnvHashMap<String, u16>,
    bundles: Vec<(String, Vec<u16>)>,
    bundle_index: FnvHashMap<String, u16>,
    dependencies: Vec<(u16, Vec<u16>)>,
    bundle_dependencies: Vec<(u16, Vec<u16>)>,
}

impl ManifestWriter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers a bundle and the assets packed into it.
    pub fn add_bundle(
        &mut self,
        bundle_id: &str,
        asset_ids: &[&str],
    ) -> PakratResult<()> {
        if self.bundle_index.contains_key(bundle_id) {
            return Err(PakratError::Configuration(format!(
                "duplicate bundle {:?}",
                bundle_id
            )));
        }

        let bundle_ix = u16::try_from(self.bundles.len()).map_err(|_| {
            PakratError::Configuration("more bundles than a u16 index can address".to_string())
        })?;

        let mut assets = Vec::with_capacity(asset_ids.len());
        for id in asset_ids {
            assets.push(self.intern_asset(id)?);
        }

        self.bundle_index.insert(bundle_id.to_string(), bundle_ix);
        self.bundles.push((bundle_id.to_string(), assets));
        Ok(())
    }

    pub fn set_dependencies(
        &mut self,
        asset_id: &str,
        dependency_ids: &[&str],
    ) -> PakratResult<()> {
        let subject = self.intern_asset(asset_id)?;
        if self.dependencies.iter().any(|(s, _)| *s == subject) {
            return Err(PakratError::Configuration(format!(
                "duplicate dependency record for asset {:?}",
                asset_id
            )));
        }

        let mut deps = Vec::with_capacity(dependency_ids.len());
        for id in dependency_ids {
            deps.push(self.intern_asset(id)?);
        }
        self.dependencies.push((subject, deps));
        Ok(())
    }

    pub fn set_bundle_dependencies(
        &mut self,
        bundle_id: &str,
        dependency_ids: &[&str],
    ) -> PakratResult<()> {
        let subject = self.bundle_ix(bundle_id)?;
        if self.bundle_dependencies.iter().any(|(s, _)| *s == subject) {
            return Err(PakratError::Configuration(format!(
                "duplicate bundle dependency record for {:?}",
                bundle_id
            )));
        }

        let mut deps = Vec::with_capacity(dependency_ids.len());
        for id in dependency_ids {
            deps.push(self.bundle_ix(id)?);
        }
        self.bundle_dependencies.push((subject, deps));
        Ok(())
    }

    /// Emits the manifest table entries into an archive writer.
    pub fn write(
        &self,
        archive: &mut ArchiveWriter,
    ) -> PakratResult<()> {
        archive.add_entry(ASSET_TABLE, self.asset_table()?);
        archive.add_entry(BUNDLE_TABLE, self.bundle_table()?);
        archive.add_entry(DEPENDENCY_TABLE, self.record_table(&self.dependencies)?);
        if !self.bundle_dependencies.is_empty() {
            archive.add_entry(
                BUNDLE_DEPENDENCY_TABLE,
                self.record_table(&self.bundle_dependencies)?,
            );
        }
        Ok(())
    }

    fn intern_asset(
        &mut self,
        id: &str,
    ) -> PakratResult<u16> {
        if let Some(ix) = self.asset_index.get(id) {
            return Ok(*ix);
        }

        let ix = u16::try_from(self.assets.len()).map_err(|_| {
            PakratError::Configuration("more assets than a u16 index can address".to_string())
        })?;
        self.asset_index.insert(id.to_string(), ix);
        self.assets.push(id.to_string());
        Ok(ix)
    }

    fn bundle_ix(
        &self,
        id: &str,
    ) -> PakratResult<u16> {
        self.bundle_index.get(id).copied().ok_or_else(|| {
            PakratError::Configuration(format!("unknown bundle {:?} in dependency record", id))
        })
    }

    fn asset_table(&self) -> PakratResult<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.assets.len() as u16).to_le_bytes());
        for id in &self.assets {
            write_str(&mut out, id)?;
        }
        Ok(out)
    }

    fn bundle_table(&self) -> PakratResult<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.bundles.len() as u16).to_le_bytes());
        for (id, assets) in &self.bundles {
            write_str(&mut out, id)?;
            out.extend_from_slice(&(assets.len() as u16).to_le_bytes());
            for asset in assets {
                out.extend_from_slice(&asset.to_le_bytes());
            }
        }
        Ok(out)
    }

    fn record_table(
        &self,
        records: &[(u16, Vec<u16>)],
    ) -> PakratResult<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&(records.len() as u16).to_le_bytes());
        for (subject, deps) in records {
            let total = u16::try_from(1 + deps.len()).map_err(|_| {
                PakratError::Configuration(format!(
                    "dependency record for index {} does not fit a u16 count",
                    subject
                ))
            })?;
            out.extend_from_slice(&total.to_le_bytes());
            out.extend_from_slice(&subject.to_le_bytes());
            for dep in deps {
                out.extend_from_slice(&dep.to_le_bytes());
            }
        }
        Ok(out)
    }
}
