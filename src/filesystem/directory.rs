use bytemuck::Zeroable;
use log::{debug, error, warn};

use crate::structs::time::unix_to_exfat;
use crate::structs::*;
use crate::Error;

use super::repair::{Corruption, Decision};
use super::{Filesystem, NodeRef};

/// Position inside a cached directory.
/// Holds references to the directory and to the last returned child.
#[derive(Debug)]
pub struct DirCursor {
    dir: NodeRef,
    current: Option<NodeRef>,
    started: bool,
}

impl DirCursor {
    pub fn directory(&self) -> &NodeRef {
        &self.dir
    }
}

impl Filesystem {
    /// Read `n` entries of `dir` at `offset`, `None` at the end of the directory
    pub(crate) fn read_entries(
        &mut self,
        dir: NodeId,
        n: usize,
        offset: u64,
    ) -> Result<Option<Vec<RawEntry>>, Error> {
        assert!(
            self.cache[dir].is_directory(),
            "attempted to read entries from a file"
        );
        let mut entries = vec![RawEntry::zeroed(); n];
        let expected = n * ENTRY_SIZE as usize;
        match self.read_at(dir, bytemuck::cast_slice_mut(&mut entries), offset)? {
            0 => Ok(None),
            size if size == expected => Ok(Some(entries)),
            size => {
                error!("Read {size} bytes instead of {expected} bytes");
                Err(Error::Corrupted)
            }
        }
    }

    pub(crate) fn write_entries(
        &mut self,
        dir: NodeId,
        entries: &[RawEntry],
        offset: u64,
    ) -> Result<(), Error> {
        assert!(
            self.cache[dir].is_directory(),
            "attempted to write entries into a file"
        );
        let expected = entries.len() * ENTRY_SIZE as usize;
        match self.write_at(dir, bytemuck::cast_slice(entries), offset)? {
            size if size == expected => Ok(()),
            size => {
                error!("Wrote {size} bytes instead of {expected} bytes");
                Err(Error::Corrupted)
            }
        }
    }

    fn load_upcase(&mut self, entry: &UpcaseEntry) -> Result<(), Error> {
        let start = entry.start_cluster.get();
        if self.superblock.is_cluster_invalid(start) {
            error!("Invalid cluster {start:#x} in upcase table");
            return Err(Error::Corrupted);
        }
        let size = entry.size.get();
        if size == 0 || size > UPCASE_CHARS as u64 * 2 || size % 2 != 0 {
            error!("Bad upcase table size ({size} bytes)");
            return Err(Error::Corrupted);
        }
        let mut buffer = vec![0u8; size as usize];
        let position = self.c2o(start);
        self.device.pread(&mut buffer, position).map_err(|e| {
            error!("Failed to read upper case table ({size} bytes starting at cluster {start:#x}): {e}");
            e
        })?;
        let compressed: Vec<u16> = bytemuck::cast_slice::<u8, Le16>(&buffer)
            .iter()
            .map(|c| c.get())
            .collect();
        self.upcase = Upcase::decompress(&compressed);
        self.has_upcase = true;
        debug!("Loaded upcase table of {} units", compressed.len());
        Ok(())
    }

    fn load_bitmap(&mut self, entry: &BitmapEntry) -> Result<(), Error> {
        let start = entry.start_cluster.get();
        if self.superblock.is_cluster_invalid(start) {
            error!("Invalid cluster {start:#x} in clusters bitmap");
            return Err(Error::Corrupted);
        }
        let cmap = ClusterMap::new(start, self.superblock.cluster_count());
        if entry.size.get() < cmap.byte_size() as u64 {
            error!(
                "Invalid clusters bitmap size: {} (expected at least {})",
                entry.size,
                cmap.byte_size()
            );
            return Err(Error::Corrupted);
        }
        self.cmap = cmap;
        let mut buffer = vec![0u8; self.cmap.byte_size()];
        let position = self.c2o(start);
        self.device.pread(&mut buffer, position).map_err(|e| {
            error!("Failed to read clusters bitmap starting at cluster {start:#x}: {e}");
            e
        })?;
        self.cmap.load(&buffer);
        self.has_bitmap = true;
        debug!(
            "Loaded clusters bitmap, {} of {} clusters free",
            self.cmap.count_free(),
            self.cmap.size
        );
        Ok(())
    }

    fn load_label(&mut self, entry: &LabelEntry) -> Result<(), Error> {
        if entry.length as usize > ENAME_MAX {
            error!("Too long label ({} chars)", entry.length);
            return Err(Error::Corrupted);
        }
        self.label = String::from_utf16(&entry.label()).map_err(|_| {
            error!("Volume label is not valid UTF-16");
            Error::Corrupted
        })?;
        Ok(())
    }

    /// Validate a parsed node, fixing what the repair policy allows
    fn check_node(
        &mut self,
        node: &mut Node,
        actual_checksum: u16,
        file: &FileEntry,
        info: &FileInfoEntry,
    ) -> Result<(), Error> {
        let cluster_size = self.superblock.cluster_size();
        let name = node.name();
        let mut failures = Vec::new();

        // everything else is garbage if the checksum is off
        if actual_checksum != file.checksum.get() {
            error!(
                "'{name}' has invalid checksum ({actual_checksum:#x} != {:#x})",
                file.checksum.get()
            );
            let corruption = Corruption::NodeChecksum {
                name: name.clone(),
                stored: file.checksum.get(),
                computed: actual_checksum,
            };
            match self.ask_to_fix(corruption) {
                Decision::Fix => {
                    // rewritten by the next flush
                    node.is_dirty = true;
                    self.errors_fixed += 1;
                }
                Decision::Accept => {}
                Decision::Reject => return Err(Error::Corrupted),
            }
        }

        if info.valid_size.get() > node.size {
            failures.push(format!(
                "'{name}' has valid size ({}) greater than size ({})",
                info.valid_size, node.size
            ));
        }
        if node.size == 0 && node.start_cluster != CLUSTER_FREE {
            failures.push(format!(
                "'{name}' is empty but start cluster is {:#x}",
                node.start_cluster
            ));
        }
        if node.size > 0 && self.superblock.is_cluster_invalid(node.start_cluster) {
            failures.push(format!(
                "'{name}' points to invalid cluster {:#x}",
                node.start_cluster
            ));
        }
        if node.size > self.superblock.heap_size() {
            failures.push(format!(
                "'{name}' is larger than clusters heap: {} > {}",
                node.size,
                self.superblock.heap_size()
            ));
        }
        if node.size == 0 && node.is_contiguous {
            failures.push(format!(
                "'{name}' is empty but marked as contiguous ({:#x})",
                node.attrib
            ));
        }
        if node.is_directory() && node.size % cluster_size != 0 {
            failures.push(format!(
                "'{name}' directory size {} is not divisible by {cluster_size}",
                node.size
            ));
        }

        if failures.is_empty() {
            return Ok(());
        }
        for failure in &failures {
            error!("{failure}");
        }
        self.errors += failures.len() as u32;
        Err(Error::Corrupted)
    }

    /// Build a node from a complete FILE entry set
    fn parse_file_entries(&mut self, entries: &[RawEntry]) -> Result<Node, Error> {
        if !check_entries(entries) {
            return Err(Error::Corrupted);
        }
        let file: FileEntry = bytemuck::cast(entries[0]);
        let info: FileInfoEntry = bytemuck::cast(entries[1]);
        if file.continuations < 2 {
            error!("Too few continuations ({})", file.continuations);
            return Err(Error::Corrupted);
        }
        if info.flags & !(FLAG_ALWAYS1 | FLAG_CONTIGUOUS) != 0 {
            error!("Unknown flags in file info entry ({:#x})", info.flags);
            return Err(Error::Corrupted);
        }
        let mandatory = 2 + name_entry_count(info.name_length as usize);
        if (file.continuations as usize) < mandatory - 1 {
            error!(
                "Too few continuations ({} < {})",
                file.continuations,
                mandatory - 1
            );
            return Err(Error::Corrupted);
        }
        if entries[2..mandatory]
            .iter()
            .any(|entry| entry.kind != ENTRY_FILE_NAME)
        {
            error!("Name of length {} is not fully stored", info.name_length);
            return Err(Error::Corrupted);
        }

        let name = read_name(&entries[2..mandatory], info.name_length as usize);
        let mut node = Node::from_entries(&file, &info, name, self.timezone);
        self.check_node(&mut node, entry_set_checksum(entries), &file, &info)?;
        Ok(node)
    }

    fn parse_file_entry(&mut self, dir: NodeId, offset: &mut u64, n: usize) -> Result<NodeId, Error> {
        let entries = self.read_entries(dir, n, *offset)?.ok_or_else(|| {
            error!("Entry set at offset {offset} is cut by the end of the directory");
            Error::Corrupted
        })?;
        let mut node = self.parse_file_entries(&entries)?;
        node.entry_offset = *offset;
        *offset += n as u64 * ENTRY_SIZE;
        Ok(self.cache.insert(node))
    }

    /// Decide what happens to an in-use entry nobody understands
    fn unknown_entry(&mut self, dir: NodeId, entry: RawEntry, offset: u64) -> Result<(), Error> {
        error!("Unknown entry type {:#x}", entry.kind);
        let corruption = Corruption::UnknownEntry {
            kind: entry.kind,
            offset,
        };
        match self.ask_to_fix(corruption) {
            Decision::Fix => {
                self.write_entries(dir, &[entry.deleted()], offset)?;
                self.errors_fixed += 1;
                Ok(())
            }
            Decision::Accept => Ok(()),
            Decision::Reject => Err(Error::Corrupted),
        }
    }

    /// Scan `dir` from `offset` to the next file, loading volume metadata on the way
    fn next_node(&mut self, dir: NodeId, offset: &mut u64) -> Result<Option<NodeId>, Error> {
        let is_root = dir == self.root_id;
        loop {
            let Some(entries) = self.read_entries(dir, 1, *offset)? else {
                return Ok(None);
            };
            let raw = entries[0];
            match Entry::decode(raw) {
                Entry::File(file) => {
                    return self
                        .parse_file_entry(dir, offset, 1 + file.continuations as usize)
                        .map(Some);
                }
                Entry::Upcase(upcase) if is_root => {
                    if !self.has_upcase {
                        self.load_upcase(&upcase)?;
                    }
                }
                Entry::Bitmap(bitmap) if is_root => {
                    if !self.has_bitmap {
                        self.load_bitmap(&bitmap)?;
                    }
                }
                Entry::Label(label) if is_root => self.load_label(&label)?,
                Entry::Upcase(_) | Entry::Bitmap(_) | Entry::Label(_) => {
                    warn!("Ignoring volume entry {:#x} outside of the root directory", raw.kind);
                }
                _ if !raw.is_valid() => {}
                _ if raw.is_benign_primary() => {
                    debug!("Skipping benign entry {:#x} at offset {offset}", raw.kind);
                }
                _ => self.unknown_entry(dir, raw, *offset)?,
            }
            *offset += ENTRY_SIZE;
        }
    }

    /// Load children of `dir` in on-disk order, a no-op if already cached
    pub(crate) fn cache_directory(&mut self, dir: NodeId) -> Result<(), Error> {
        if self.cache[dir].is_cached {
            return Ok(());
        }
        let mut offset = 0;
        let mut previous = None;
        let mut built = Vec::new();
        let result = loop {
            match self.next_node(dir, &mut offset) {
                Ok(Some(node)) => {
                    self.cache.append(dir, node, previous);
                    previous = Some(node);
                    built.push(node);
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = result {
            for node in built {
                self.cache.detach(node);
                self.cache.remove(node);
            }
            return Err(e);
        }
        self.cache[dir].is_cached = true;
        debug!(
            "Cached {} entries of '{}'",
            self.cache.children(dir).len(),
            self.cache[dir].name()
        );
        Ok(())
    }

    /// Write node metadata back into its parent's entry set
    pub fn flush_node(&mut self, node: &NodeRef) -> Result<(), Error> {
        let id = self.resolve(node);
        self.flush_entry(id)
    }

    pub(crate) fn flush_entry(&mut self, id: NodeId) -> Result<(), Error> {
        let node = &self.cache[id];
        if !node.is_dirty {
            return Ok(());
        }
        assert!(!self.read_only, "unable to flush node to read-only FS");
        // unlinked nodes and the root have no entries
        let Some(parent) = node.parent else {
            return Ok(());
        };
        let count = node.entry_count();
        let offset = node.entry_offset;

        let mut entries = self.read_entries(parent, count, offset)?.ok_or(Error::Corrupted)?;
        if !check_entries(&entries) {
            return Err(Error::Corrupted);
        }
        let node = &self.cache[id];
        let mut file: FileEntry = bytemuck::cast(entries[0]);
        let mut info: FileInfoEntry = bytemuck::cast(entries[1]);

        file.attrib = node.attrib.into();
        let mtime = unix_to_exfat(node.mtime, self.timezone);
        file.mdate = mtime.date.into();
        file.mtime = mtime.time.into();
        file.mtime_cs = mtime.centisec;
        let atime = unix_to_exfat(node.atime, self.timezone);
        file.adate = atime.date.into();
        file.atime = atime.time.into();
        info.size = node.size.into();
        info.valid_size = node.valid_size.into();
        info.start_cluster = node.start_cluster.into();
        info.flags = FLAG_ALWAYS1;
        // empty files are never contiguous
        if node.size != 0 && node.is_contiguous {
            info.flags |= FLAG_CONTIGUOUS;
        }
        // name hash is left as is

        entries[0] = bytemuck::cast(file);
        entries[1] = bytemuck::cast(info);
        seal_entry_set(&mut entries);
        self.write_entries(parent, &entries, offset)?;
        self.cache[id].is_dirty = false;
        self.flush()
    }

    fn flush_subtree(&mut self, id: NodeId) -> Result<(), Error> {
        for child in self.cache.children(id) {
            self.flush_subtree(child)?;
        }
        self.flush_entry(id)
    }

    /// Flush every dirty cached node and release forgotten unlinked ones
    pub fn flush_nodes(&mut self) -> Result<(), Error> {
        self.reap_unlinked()?;
        self.flush_subtree(self.root_id)
    }

    /// Start iterating over the children of `dir`
    pub fn opendir(&mut self, dir: &NodeRef) -> Result<DirCursor, Error> {
        let id = self.resolve(dir);
        if !self.cache[id].is_directory() {
            return Err(Error::NotDirectory);
        }
        self.cache_directory(id)?;
        Ok(DirCursor {
            dir: self.cache.handle(id),
            current: None,
            started: false,
        })
    }

    /// Next child of the directory, `None` after the last one
    pub fn readdir(&mut self, cursor: &mut DirCursor) -> Option<NodeRef> {
        let next = if cursor.started {
            cursor
                .current
                .as_ref()
                .and_then(|current| self.cache[current.id].next)
        } else {
            cursor.started = true;
            self.cache[cursor.dir.id].child
        };
        cursor.current = next.map(|id| self.cache.handle(id));
        cursor.current.clone()
    }

    pub fn closedir(&mut self, cursor: DirCursor) -> Result<(), Error> {
        if let Some(current) = cursor.current {
            self.put_node(current)?;
        }
        self.put_node(cursor.dir)
    }
}
