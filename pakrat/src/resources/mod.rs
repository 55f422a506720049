//! The asset tier: reference-counted loading of individual assets, resolved
//! through the container tier, with four completion styles over one shared
//! load state.

mod resource;
pub use resource::ResourceHandle;

mod resource_future;
pub use resource_future::ResourceFuture;

mod auto_unload;
pub use auto_unload::AutoUnload;

mod resource_manager;
pub use resource_manager::ResourceManager;
pub use resource_manager::ResourceManagerConfig;
pub use resource_manager::ResourceManagerMetrics;
pub use resource_manager::SourceMode;
