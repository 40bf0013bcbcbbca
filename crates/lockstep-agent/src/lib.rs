//! Worker process host, sample plugins and a toy track for the `lockstep` binaries.

pub mod plugins;
pub mod track;

pub use plugins::default_registry;
pub use track::Track;
