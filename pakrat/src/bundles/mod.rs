//! The container tier: reference-counted loading of bundle archives.

mod bundle;
pub use bundle::BundleHandle;
pub(crate) use bundle::read_all_at;

mod bundle_manager;
pub use bundle_manager::BundleManager;
pub use bundle_manager::BundleManagerMetrics;
