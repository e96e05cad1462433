// External tool collaborators
//
// - process.rs: launching external programs and streaming their output
// - mounter.rs: disk-image mount backends and the unmount guard
// - generator.rs: boot-material generator invocation and output layout

pub mod generator;
pub mod mounter;
pub mod process;

#[cfg(test)]
pub(crate) mod testing;




pub use generator::{BootMaterial, BootMaterialGenerator};
pub use mounter::{ImageMounter, LoopMounter, MountGuard, MountPoint, OsfMounter};
pub use process::{run_streaming, SystemLauncher, ToolCommand, ToolExit, ToolLauncher, ToolProcess};
