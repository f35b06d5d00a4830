mod bitmap;
mod byteorder;
mod entry;
mod node;
mod superblock;
pub(crate) mod time;
mod upcase;

use std::rc::Rc;

use bytemuck::{Pod, Zeroable};

pub use byteorder::*;
pub use entry::*;
pub use superblock::*;

pub const EXFAT_SIGNATURE: &[u8; 8] = b"EXFAT   ";
pub const BOOT_SIGNATURE: u16 = 0xAA55;
/// Sectors covered by the VBR checksum, the checksum sector follows them
pub const VBR_SECTORS: u64 = 11;
pub const STATE_MOUNTED: u16 = 2;
pub const ALLOCATED_PERCENT_UNKNOWN: u8 = 0xff;

pub const FIRST_DATA_CLUSTER: u32 = 2;
pub const LAST_DATA_CLUSTER: u32 = 0xFFFF_FFF6;
pub const CLUSTER_FREE: u32 = 0;
pub const CLUSTER_BAD: u32 = 0xFFFF_FFF7;
pub const CLUSTER_END: u32 = 0xFFFF_FFFF;

pub const ENTRY_SIZE: u64 = 32;
/// UTF-16 units per name entry
pub const ENAME_MAX: usize = 15;
/// UTF-16 units per file name
pub const NAME_MAX: usize = 255;
pub const UPCASE_CHARS: usize = 0x10000;

pub const ENTRY_VALID: u8 = 0x80;
pub const ENTRY_CONTINUED: u8 = 0x40;
pub const ENTRY_OPTIONAL: u8 = 0x20;
pub const ENTRY_BITMAP: u8 = 0x01 | ENTRY_VALID;
pub const ENTRY_UPCASE: u8 = 0x02 | ENTRY_VALID;
pub const ENTRY_LABEL: u8 = 0x03 | ENTRY_VALID;
pub const ENTRY_FILE: u8 = 0x05 | ENTRY_VALID;
pub const ENTRY_FILE_INFO: u8 = ENTRY_VALID | ENTRY_CONTINUED;
pub const ENTRY_FILE_NAME: u8 = 0x01 | ENTRY_VALID | ENTRY_CONTINUED;
pub const ENTRY_FILE_TAIL: u8 = ENTRY_VALID | ENTRY_CONTINUED | ENTRY_OPTIONAL;

pub const ATTRIB_RO: u16 = 0x01;
pub const ATTRIB_HIDDEN: u16 = 0x02;
pub const ATTRIB_SYSTEM: u16 = 0x04;
pub const ATTRIB_VOLUME: u16 = 0x08;
pub const ATTRIB_DIR: u16 = 0x10;
pub const ATTRIB_ARCH: u16 = 0x20;

pub const FLAG_ALWAYS1: u8 = 0x01;
pub const FLAG_CONTIGUOUS: u8 = 0x02;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct Superblock {
    /// Boot jump instruction
    pub(crate) jump: [u8; 3],
    /// OEM name, always "EXFAT   "
    pub(crate) oem_name: [u8; 8],
    #[doc(hidden)]
    pub(crate) __unused_1: [u8; 53],
    /// Partition offset in sectors
    pub(crate) sector_start: Le64,
    /// Volume length in sectors
    pub(crate) sector_count: Le64,
    /// First FAT sector
    pub(crate) fat_sector_start: Le32,
    /// FAT length in sectors
    pub(crate) fat_sector_count: Le32,
    /// First sector of the cluster heap
    pub(crate) cluster_sector_start: Le32,
    /// Clusters in the heap
    pub(crate) cluster_count: Le32,
    /// First cluster of the root directory
    pub(crate) rootdir_cluster: Le32,
    pub(crate) volume_serial: Le32,
    pub(crate) version_minor: u8,
    pub(crate) version_major: u8,
    /// Volume flags, see [`STATE_MOUNTED`]
    pub(crate) volume_state: Le16,
    /// Sector size as a power of 2
    pub(crate) sector_bits: u8,
    /// Sectors per cluster as a power of 2
    pub(crate) spc_bits: u8,
    pub(crate) fat_count: u8,
    pub(crate) drive_no: u8,
    /// Allocated space hint in percent, 0xff if unknown
    pub(crate) allocated_percent: u8,
    #[doc(hidden)]
    pub(crate) __unused_2: [u8; 397],
    pub(crate) boot_signature: Le16,
}

/// Undecoded directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct RawEntry {
    pub(crate) kind: u8,
    pub(crate) data: [u8; 31],
}

/// Primary entry of a file entry set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FileEntry {
    pub(crate) kind: u8,
    /// Secondary entries following this one
    pub(crate) continuations: u8,
    pub(crate) checksum: Le16,
    pub(crate) attrib: Le16,
    #[doc(hidden)]
    pub(crate) __unknown_1: [u8; 2],
    pub(crate) crtime: Le16,
    pub(crate) crdate: Le16,
    pub(crate) mtime: Le16,
    pub(crate) mdate: Le16,
    pub(crate) atime: Le16,
    pub(crate) adate: Le16,
    pub(crate) crtime_cs: u8,
    pub(crate) mtime_cs: u8,
    #[doc(hidden)]
    pub(crate) __unknown_2: [u8; 10],
}

/// Stream extension entry, always second in a file entry set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FileInfoEntry {
    pub(crate) kind: u8,
    pub(crate) flags: u8,
    #[doc(hidden)]
    pub(crate) __unknown_1: u8,
    /// Name length in UTF-16 units
    pub(crate) name_length: u8,
    pub(crate) name_hash: Le16,
    #[doc(hidden)]
    pub(crate) __unknown_2: [u8; 2],
    /// Initialized data length
    pub(crate) valid_size: Le64,
    #[doc(hidden)]
    pub(crate) __unknown_3: [u8; 4],
    pub(crate) start_cluster: Le32,
    pub(crate) size: Le64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct NameEntry {
    pub(crate) kind: u8,
    #[doc(hidden)]
    pub(crate) __unknown: u8,
    pub(crate) name: [Le16; ENAME_MAX],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct BitmapEntry {
    pub(crate) kind: u8,
    #[doc(hidden)]
    pub(crate) __unknown: [u8; 19],
    pub(crate) start_cluster: Le32,
    /// Length in bytes
    pub(crate) size: Le64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct UpcaseEntry {
    pub(crate) kind: u8,
    #[doc(hidden)]
    pub(crate) __unknown_1: [u8; 3],
    pub(crate) checksum: Le32,
    #[doc(hidden)]
    pub(crate) __unknown_2: [u8; 12],
    pub(crate) start_cluster: Le32,
    /// Length of the compressed table in bytes
    pub(crate) size: Le64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LabelEntry {
    pub(crate) kind: u8,
    /// Label length in UTF-16 units
    pub(crate) length: u8,
    pub(crate) name: [Le16; ENAME_MAX],
}

/// Decoded directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    Bitmap(BitmapEntry),
    Upcase(UpcaseEntry),
    Label(LabelEntry),
    File(FileEntry),
    FileInfo(FileInfoEntry),
    FileName(NameEntry),
    /// Deleted, benign or unrecognized entry
    Other(RawEntry),
}

/// Index of a node in the node arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// In-core file or directory
#[derive(Debug)]
pub struct Node {
    pub(crate) parent: Option<NodeId>,
    /// Head of the children list
    pub(crate) child: Option<NodeId>,
    pub(crate) next: Option<NodeId>,
    pub(crate) prev: Option<NodeId>,
    /// Shared with every live handle, strong count minus one equals references
    pub(crate) pin: Rc<()>,
    /// Index of the cluster cached in `fptr_cluster`
    pub(crate) fptr_index: u32,
    pub(crate) fptr_cluster: u32,
    /// Byte offset of the FILE entry inside the parent directory
    pub(crate) entry_offset: u64,
    pub(crate) start_cluster: u32,
    pub(crate) attrib: u16,
    pub(crate) continuations: u8,
    pub(crate) is_contiguous: bool,
    pub(crate) is_cached: bool,
    pub(crate) is_dirty: bool,
    pub(crate) is_unlinked: bool,
    pub(crate) size: u64,
    /// Initialized data length, bytes past it read as zeros
    pub(crate) valid_size: u64,
    /// Unix seconds
    pub(crate) mtime: i64,
    /// Unix seconds
    pub(crate) atime: i64,
    /// UTF-16 name, at most [`NAME_MAX`] units
    pub(crate) name: Vec<u16>,
}

/// Allocation bitmap of the cluster heap, bit `n` maps to cluster `n + 2`
#[derive(Debug, Clone)]
pub struct ClusterMap {
    pub(crate) start_cluster: u32,
    /// Number of clusters tracked
    pub(crate) size: u32,
    pub(crate) words: Vec<u64>,
    pub(crate) dirty: bool,
}

/// Volume upcase table
#[derive(Clone)]
pub struct Upcase {
    pub(crate) table: Vec<u16>,
}
