use std::fmt::Display;
use std::rc::Rc;

use super::time::{exfat_to_unix, Timestamp};
use super::*;

impl Node {
    /// Detached node with no clusters
    pub(crate) fn new(attrib: u16) -> Self {
        Self {
            parent: None,
            child: None,
            next: None,
            prev: None,
            pin: Rc::new(()),
            fptr_index: 0,
            fptr_cluster: CLUSTER_FREE,
            entry_offset: 0,
            start_cluster: CLUSTER_FREE,
            attrib,
            continuations: 0,
            is_contiguous: false,
            is_cached: false,
            is_dirty: false,
            is_unlinked: false,
            size: 0,
            valid_size: 0,
            mtime: 0,
            atime: 0,
            name: Vec::new(),
        }
    }

    /// Root directory, which has no entry set and no timestamps
    pub(crate) fn root(start_cluster: u32) -> Self {
        let mut root = Self::new(ATTRIB_DIR);
        root.start_cluster = start_cluster;
        root.fptr_cluster = start_cluster;
        root
    }

    /// Build a node from the two metadata entries of its entry set
    pub(crate) fn from_entries(
        file: &FileEntry,
        info: &FileInfoEntry,
        name: Vec<u16>,
        timezone: i64,
    ) -> Self {
        let mut node = Self::new(file.attrib.get());
        node.continuations = file.continuations;
        node.mtime = exfat_to_unix(
            Timestamp {
                date: file.mdate.get(),
                time: file.mtime.get(),
                centisec: file.mtime_cs,
            },
            timezone,
        );
        // there is no centiseconds field for atime
        node.atime = exfat_to_unix(
            Timestamp {
                date: file.adate.get(),
                time: file.atime.get(),
                centisec: 0,
            },
            timezone,
        );
        node.size = info.size.get();
        node.valid_size = info.valid_size.get();
        node.start_cluster = info.start_cluster.get();
        node.fptr_cluster = node.start_cluster;
        node.is_contiguous = info.flags & FLAG_CONTIGUOUS != 0;
        node.name = name;
        node
    }

    pub(crate) fn references(&self) -> usize {
        Rc::strong_count(&self.pin) - 1
    }

    /// Entries in the parent directory describing this node
    pub(crate) fn entry_count(&self) -> usize {
        1 + self.continuations as usize
    }

    pub fn is_directory(&self) -> bool {
        self.attrib & ATTRIB_DIR != 0
    }

    pub fn name(&self) -> String {
        String::from_utf16_lossy(&self.name)
    }

    pub fn attrib(&self) -> u16 {
        self.attrib
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn valid_size(&self) -> u64 {
        self.valid_size
    }

    pub fn start_cluster(&self) -> u32 {
        self.start_cluster
    }

    pub fn is_contiguous(&self) -> bool {
        self.is_contiguous
    }

    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    pub fn mtime(&self) -> i64 {
        self.mtime
    }

    pub fn atime(&self) -> i64 {
        self.atime
    }
}

impl Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flag = |bit: u16, c: char| if self.attrib & bit != 0 { c } else { '-' };
        writeln!(f, "Name:          {}", self.name())?;
        writeln!(
            f,
            "Attributes:    {}{}{}{}{}",
            flag(ATTRIB_DIR, 'd'),
            flag(ATTRIB_RO, 'r'),
            flag(ATTRIB_HIDDEN, 'h'),
            flag(ATTRIB_SYSTEM, 's'),
            flag(ATTRIB_ARCH, 'a')
        )?;
        writeln!(f, "Size:          {} ({} valid)", self.size, self.valid_size)?;
        writeln!(
            f,
            "Start cluster: {:#x}{}",
            self.start_cluster,
            if self.is_contiguous { " (contiguous)" } else { "" }
        )?;
        writeln!(f, "Entry offset:  {}", self.entry_offset)?;
        writeln!(f, "Modified:      {}", self.mtime)?;
        write!(f, "Accessed:      {}", self.atime)
    }
}
