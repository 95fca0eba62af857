// Adapters - External system implementations

pub mod fs_local;
#[cfg(feature = "libav")]
pub mod libav;
pub mod memory;
pub mod toml_config;

// Re-export adapters
pub use fs_local::LocalFsAdapter;
#[cfg(feature = "libav")]
pub use libav::LibavBackend;
pub use memory::{MemoryBackend, MemoryScript};
pub use toml_config::TomlConfigAdapter;
