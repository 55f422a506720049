// Drives the cache end to end: writes a small pack to disk, then runs a real
// frame loop exercising the blocking, callback, ticket, and RAII styles.

use pakrat::FileResolver;
use pakrat::PakratResult;
use pakrat::ResourceManager;
use pakrat::ResourceManagerConfig;
use pakrat_format::ArchiveWriter;
use pakrat_format::ManifestWriter;
use pakrat_format::MANIFEST_BUNDLE;
use std::path::Path;
use std::time::Duration;
use std::time::Instant;

pub fn logging_init() {
    #[cfg(not(debug_assertions))]
    let log_level = log::LevelFilter::Info;
    #[cfg(debug_assertions)]
    let log_level = log::LevelFilter::Debug;

    // Setup logging
    env_logger::Builder::from_default_env()
        .default_format_timestamp_nanos(true)
        .filter_module("pakrat::bundles", log::LevelFilter::Trace)
        .filter_module("pakrat::resources", log::LevelFilter::Trace)
        .filter_level(log_level)
        .init();
}

fn write_demo_pack(dir: &Path) -> PakratResult<()> {
    std::fs::create_dir_all(dir)?;

    let mut manifest = ManifestWriter::new();
    manifest.add_bundle("characters", &["Hero"])?;
    manifest.add_bundle("parts", &["Arm", "Leg"])?;
    manifest.set_dependencies("Hero", &["Arm", "Leg"])?;

    let mut root = ArchiveWriter::new();
    manifest.write(&mut root)?;
    std::fs::write(dir.join(MANIFEST_BUNDLE), root.into_bytes()?)?;

    let mut characters = ArchiveWriter::new();
    characters.add_entry("Hero", b"hero model".to_vec());
    std::fs::write(dir.join("characters"), characters.into_bytes()?)?;

    // large enough that async loads span several frames at the demo chunk size
    let mut parts = ArchiveWriter::new();
    parts.add_entry("Arm", vec![1; 16 * 1024]);
    parts.add_entry("Leg", vec![2; 16 * 1024]);
    std::fs::write(dir.join("parts"), parts.into_bytes()?)?;
    Ok(())
}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> PakratResult<()> {
    logging_init();

    let pack_dir = std::env::temp_dir().join("pakrat-demo-pack");
    write_demo_pack(&pack_dir)?;
    log::info!("demo pack written to {:?}", pack_dir);

    let resolver: FileResolver = Box::new(move |id: &str| pack_dir.join(id));
    let config = ResourceManagerConfig {
        async_read_chunk_size: 4 * 1024,
        default_unload_delay_ms: 250,
        bundle_unload_delay_ms: 500,
        ..Default::default()
    };
    let mut resources = ResourceManager::new(config, resolver)?;

    // Two async styles racing the frame loop: a ticket polled by hand and a
    // callback fired by whichever update promotes the asset.
    let leg_ticket = resources.load_async("Leg")?;
    resources.load_with_callback("Arm", |handle| {
        log::info!("callback: {} finished loading", handle.url());
    })?;

    let start = Instant::now();
    let mut frame = 0u64;
    while !leg_ticket.is_done() {
        profiling::scope!("frame");
        resources.update(start.elapsed().as_millis() as u64)?;
        resources.late_update()?;
        frame += 1;
        std::thread::sleep(Duration::from_millis(16));
    }
    log::info!(
        "leg ticket completed after {} frames: {} bytes",
        frame,
        leg_ticket.payload().map(|p| p.len()).unwrap_or(0)
    );

    // Blocking: joins the already-resident dependencies and returns loaded.
    let hero = resources.load("Hero")?;
    log::info!(
        "hero loaded with {} bytes",
        hero.payload().map(|p| p.len()).unwrap_or(0)
    );

    // RAII custody: dropping the guard hands the reference back during the
    // next update.
    let hero_again = resources.load("Hero")?;
    let guard = resources.auto_unload(hero_again);
    drop(guard);

    // Hand the rest back and let the deferred sweeps drain the caches.
    resources.unload(&hero)?;
    resources.unload(&leg_ticket)?;
    resources.unload_url("Arm")?;

    loop {
        profiling::scope!("frame");
        resources.update(start.elapsed().as_millis() as u64)?;
        resources.late_update()?;
        let metrics = resources.metrics();
        if metrics.loaded_count == 0 && metrics.bundles.loaded_count == 0 {
            break;
        }
        frame += 1;
        if frame > 600 {
            log::warn!("eviction never drained: {:?}", metrics);
            break;
        }
        std::thread::sleep(Duration::from_millis(16));
    }

    let metrics = resources.metrics();
    log::info!(
        "demo done after {} frames: {} assets and {} bundles resident",
        frame,
        metrics.loaded_count,
        metrics.bundles.loaded_count
    );
    Ok(())
}
