mod errors;
pub mod gears;
pub mod group;
pub mod memory;
pub mod patcher;
pub mod pattern;
pub mod version;
pub use errors::PatchError;
pub use gears::{Behavior, PatchRegistry, RegistryConfig};
pub use group::PatchGroup;
pub use memory::{Buffer, Memory, ModuleImage};
pub use patcher::{JumpTarget, Patch, PatchDef, Replacement};
pub use pattern::Signature;
pub use version::{resolve_version, VersionCascade};
pub type Result<T> = std::result::Result<T, PatchError>;
