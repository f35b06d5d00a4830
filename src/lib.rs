//! exFAT filesystem engine: mounts a volume from any [`BlockDevice`],
//! caches its directory tree lazily and reads, writes and maintains files in place.

mod error;
pub mod filesystem;
pub mod options;
pub mod structs;

pub use error::Error;
pub use filesystem::{
    BlockDevice, Corruption, Decision, DirCursor, Device, Filesystem, Mode, NodeRef, Repair,
    RepairPolicy, Stat, StatFs,
};
pub use options::MountOptions;
