use bytemuck::Zeroable;
use log::{debug, error};

use crate::structs::time::{now, unix_to_exfat};
use crate::structs::*;
use crate::Error;

use super::{Filesystem, NodeRef};

impl Filesystem {
    /// Slots holding entries of a non-root directory are always free when no node owns them,
    /// the root also keeps bitmap, upcase and label entries
    fn check_slot(&mut self, dir: NodeId, offset: u64, n: usize) -> Result<bool, Error> {
        if dir != self.root_id {
            return Ok(true);
        }
        let entries = self.read_entries(dir, n, offset)?.ok_or(Error::Corrupted)?;
        Ok(entries.iter().all(|entry| !entry.is_valid()))
    }

    /// Offset of `n` free consecutive entries in `dir`, extending it when full
    pub(crate) fn find_slot(&mut self, dir: NodeId, n: usize) -> Result<u64, Error> {
        assert!(self.cache[dir].is_cached, "directory is not cached");
        let size = self.cache[dir].size;
        let total = (size / ENTRY_SIZE) as usize;
        let mut occupied = vec![false; total];
        for child in self.cache.children(dir) {
            let child = &self.cache[child];
            let first = (child.entry_offset / ENTRY_SIZE) as usize;
            for index in first..(first + child.entry_count()).min(total) {
                occupied[index] = true;
            }
        }

        let mut contiguous = 0;
        let mut offset = 0;
        let mut index = 0;
        while index < total {
            if occupied[index] {
                contiguous = 0;
                index += 1;
                continue;
            }
            if contiguous == 0 {
                offset = index as u64 * ENTRY_SIZE;
            }
            contiguous += 1;
            if contiguous == n {
                if self.check_slot(dir, offset, n)? {
                    return Ok(offset);
                }
                // something lives at the slot start, retry right after it
                index = (offset / ENTRY_SIZE) as usize + 1;
                contiguous = 0;
                continue;
            }
            index += 1;
        }

        if contiguous == 0 {
            offset = size;
        }
        let cluster_size = self.superblock.cluster_size();
        let new_size = (size + (n - contiguous) as u64 * ENTRY_SIZE).next_multiple_of(cluster_size);
        debug!(
            "Extending directory '{}' to {new_size} bytes",
            self.cache[dir].name()
        );
        self.resize(dir, new_size, true)?;
        Ok(offset)
    }

    /// Write a fresh entry set at `offset` and attach its node to `dir`
    fn commit_entry(
        &mut self,
        dir: NodeId,
        name: &[u16],
        offset: u64,
        attrib: u16,
    ) -> Result<NodeId, Error> {
        let stamp = unix_to_exfat(now(), self.timezone);

        let mut file = FileEntry::zeroed();
        file.kind = ENTRY_FILE;
        file.continuations = 1 + name_entry_count(name.len()) as u8;
        file.attrib = attrib.into();
        file.crdate = stamp.date.into();
        file.crtime = stamp.time.into();
        file.crtime_cs = stamp.centisec;
        file.adate = file.crdate;
        file.mdate = file.crdate;
        file.atime = file.crtime;
        file.mtime = file.crtime;
        // there is no atime_cs
        file.mtime_cs = file.crtime_cs;

        let mut info = FileInfoEntry::zeroed();
        info.kind = ENTRY_FILE_INFO;
        info.flags = FLAG_ALWAYS1;
        info.name_length = name.len() as u8;
        info.name_hash = self.upcase.name_hash(name).into();
        info.start_cluster = CLUSTER_FREE.into();

        let mut entries = vec![bytemuck::cast(file), bytemuck::cast(info)];
        entries.extend(name_entries(name));
        seal_entry_set(&mut entries);
        self.write_entries(dir, &entries, offset)?;

        let mut node = Node::from_entries(&file, &info, name.to_vec(), self.timezone);
        node.entry_offset = offset;
        let id = self.cache.insert(node);
        self.cache.attach(dir, id);
        Ok(id)
    }

    fn create(&mut self, path: &str, attrib: u16) -> Result<NodeId, Error> {
        self.check_writable()?;
        let (dir, existing, name) = self.split(path)?;
        if existing.is_some() {
            return Err(Error::Exists);
        }
        let offset = self.find_slot(dir, 2 + name_entry_count(name.len()))?;
        let id = self.commit_entry(dir, &name, offset, attrib)?;
        self.touch_mtime(dir);
        self.flush_entry(dir)?;
        debug!("Created '{path}' at offset {offset}");
        Ok(id)
    }

    /// Create an empty regular file
    pub fn mknod(&mut self, path: &str) -> Result<(), Error> {
        self.create(path, ATTRIB_ARCH).map(|_| ())
    }

    /// Create an empty directory, which always owns one cluster
    pub fn mkdir(&mut self, path: &str) -> Result<(), Error> {
        let id = self.create(path, ATTRIB_DIR)?;
        let handle = self.cache.handle(id);
        let cluster_size = self.superblock.cluster_size();
        let result = self
            .resize(id, cluster_size, true)
            .and_then(|_| self.flush_entry(id));
        if let Err(e) = result {
            if let Err(e) = self.delete(id) {
                error!("Failed to remove incomplete directory '{path}': {e}");
            }
            if let Err(e) = self.put_node(handle) {
                error!("Failed to release incomplete directory '{path}': {e}");
            }
            return Err(e);
        }
        self.put_node(handle)
    }

    /// Clear the in-use bit of `n` entries at `offset`
    fn erase_entries(&mut self, dir: NodeId, n: usize, offset: u64) -> Result<(), Error> {
        let entries = self.read_entries(dir, n, offset)?.ok_or(Error::Corrupted)?;
        let deleted: Vec<RawEntry> = entries.into_iter().map(RawEntry::deleted).collect();
        self.write_entries(dir, &deleted, offset)
    }

    fn erase_node(&mut self, id: NodeId) -> Result<(), Error> {
        let node = &self.cache[id];
        let Some(parent) = node.parent else {
            return Err(Error::InvalidArgument);
        };
        let (count, offset) = (node.entry_count(), node.entry_offset);
        self.erase_entries(parent, count, offset)?;
        self.flush_entry(parent)
    }

    /// Give back trailing clusters a directory no longer needs after a removal at `deleted_offset`
    fn shrink_directory(&mut self, dir: NodeId, deleted_offset: u64) -> Result<(), Error> {
        let node = &self.cache[dir];
        assert!(node.is_directory(), "attempted to shrink a file");
        assert!(node.is_cached, "attempted to shrink uncached directory");

        let mut last: Option<NodeId> = None;
        for child in self.cache.children(dir) {
            let offset = self.cache[child].entry_offset;
            if deleted_offset < offset {
                // later entries pin the size
                return Ok(());
            }
            if last.map_or(true, |last| self.cache[last].entry_offset < offset) {
                last = Some(child);
            }
        }
        let mut entries = last.map_or(0, |last| {
            let last = &self.cache[last];
            last.entry_offset / ENTRY_SIZE + last.entry_count() as u64
        });
        if dir == self.root_id {
            entries = self.volume_entries_end(entries)?;
        }
        let cluster_size = self.superblock.cluster_size();
        let new_size = (entries * ENTRY_SIZE)
            .next_multiple_of(cluster_size)
            .max(cluster_size);
        if new_size == self.cache[dir].size {
            return Ok(());
        }
        self.resize(dir, new_size, true)
    }

    /// Entry count the root keeps so that in-use entries past `from` stay in place,
    /// volume entries are not tracked as nodes
    fn volume_entries_end(&mut self, from: u64) -> Result<u64, Error> {
        let total = self.cache[self.root_id].size / ENTRY_SIZE;
        let mut end = from;
        for index in from..total {
            let Some(entries) = self.read_entries(self.root_id, 1, index * ENTRY_SIZE)? else {
                break;
            };
            if entries[0].is_valid() {
                end = index + 1;
            }
        }
        Ok(end)
    }

    /// Remove the entries of `id` and detach it, clusters are kept until the last reference goes away
    fn delete(&mut self, id: NodeId) -> Result<(), Error> {
        let node = &self.cache[id];
        let Some(parent) = node.parent else {
            error!("Unable to delete '{}' without a parent", node.name());
            return Err(Error::InvalidArgument);
        };
        let deleted_offset = node.entry_offset;
        self.erase_node(id)?;
        self.cache.detach(id);
        let shrunk = self.shrink_directory(parent, deleted_offset);
        self.cache[id].is_unlinked = true;
        self.cache.unlinked.push(id);
        if let Err(e) = shrunk {
            if let Err(e) = self.flush_entry(parent) {
                error!("Failed to flush directory after a failed shrink: {e}");
            }
            return Err(e);
        }
        self.touch_mtime(parent);
        self.flush_entry(parent)
    }

    /// Remove a regular file
    pub fn unlink(&mut self, node: &NodeRef) -> Result<(), Error> {
        self.check_writable()?;
        let id = self.resolve(node);
        self.unlink_node(id)
    }

    fn unlink_node(&mut self, id: NodeId) -> Result<(), Error> {
        if self.cache[id].is_directory() {
            return Err(Error::IsDirectory);
        }
        self.delete(id)
    }

    /// Remove an empty directory
    pub fn rmdir(&mut self, node: &NodeRef) -> Result<(), Error> {
        self.check_writable()?;
        let id = self.resolve(node);
        self.rmdir_node(id)
    }

    fn rmdir_node(&mut self, id: NodeId) -> Result<(), Error> {
        if !self.cache[id].is_directory() {
            return Err(Error::NotDirectory);
        }
        if id == self.root_id {
            return Err(Error::InvalidArgument);
        }
        self.cache_directory(id)?;
        if self.cache[id].child.is_some() {
            return Err(Error::NotEmpty);
        }
        self.delete(id)
    }

    /// Move the entry set of `node` to `new_offset` in `dir` under a new name
    fn rename_entry(
        &mut self,
        dir: NodeId,
        node: NodeId,
        name: &[u16],
        new_offset: u64,
    ) -> Result<(), Error> {
        let (parent, offset) = {
            let node = &self.cache[node];
            (node.parent.ok_or(Error::InvalidArgument)?, node.entry_offset)
        };
        let entries = self.read_entries(parent, 2, offset)?.ok_or(Error::Corrupted)?;
        let continuations = 1 + name_entry_count(name.len()) as u8;
        let mut file: FileEntry = bytemuck::cast(entries[0]);
        file.continuations = continuations;
        let mut info: FileInfoEntry = bytemuck::cast(entries[1]);
        info.name_length = name.len() as u8;
        info.name_hash = self.upcase.name_hash(name).into();

        self.erase_node(node)?;
        let moved = &mut self.cache[node];
        moved.entry_offset = new_offset;
        moved.continuations = continuations;

        let mut entries = vec![bytemuck::cast(file), bytemuck::cast(info)];
        entries.extend(name_entries(name));
        seal_entry_set(&mut entries);
        self.write_entries(dir, &entries, new_offset)?;

        self.cache[node].name = name.to_vec();
        self.cache.detach(node);
        self.cache.attach(dir, node);
        Ok(())
    }

    /// Move `old_path` to `new_path`, replacing a compatible existing target
    pub fn rename(&mut self, old_path: &str, new_path: &str) -> Result<(), Error> {
        self.check_writable()?;
        let node = self.lookup(old_path)?;
        let id = node.id();
        let (dir, existing, name) = self.split(new_path)?;
        let is_directory = self.cache[id].is_directory();

        if is_directory {
            let mut ancestor = Some(dir);
            while let Some(current) = ancestor {
                if current == id {
                    error!("Unable to move '{old_path}' into itself");
                    return Err(Error::InvalidArgument);
                }
                ancestor = self.cache[current].parent;
            }
        }

        if let Some(existing) = existing.filter(|&existing| existing != id) {
            match (is_directory, self.cache[existing].is_directory()) {
                (false, true) => return Err(Error::IsDirectory),
                (true, false) => return Err(Error::NotDirectory),
                _ => {}
            }
            let target = self.cache.handle(existing);
            let removed = if is_directory {
                self.rmdir_node(existing)
            } else {
                self.unlink_node(existing)
            };
            // clusters of a removed target are released here even on failure
            let released = self.put_node(target);
            removed?;
            released?;
        }

        let offset = self.find_slot(dir, 2 + name_entry_count(name.len()))?;
        self.rename_entry(dir, id, &name, offset)?;
        self.flush_entry(dir)?;
        debug!("Renamed '{old_path}' to '{new_path}'");
        self.put_node(node)
    }

    /// Offset of the label entry in the root directory
    fn find_label(&mut self) -> Result<Option<u64>, Error> {
        let mut offset = 0;
        while let Some(entries) = self.read_entries(self.root_id, 1, offset)? {
            if entries[0].kind == ENTRY_LABEL {
                return Ok(Some(offset));
            }
            offset += ENTRY_SIZE;
        }
        Ok(None)
    }

    /// Change the volume label, an empty label removes it
    pub fn set_label(&mut self, label: &str) -> Result<(), Error> {
        self.check_writable()?;
        let units: Vec<u16> = label.encode_utf16().collect();
        if units.len() > ENAME_MAX {
            error!("Label '{label}' is longer than {ENAME_MAX} units");
            return Err(Error::NameTooLong);
        }
        let offset = match self.find_label()? {
            Some(offset) => offset,
            None => self.find_slot(self.root_id, 1)?,
        };
        let entry = LabelEntry::new(&units);
        self.write_entries(self.root_id, &[bytemuck::cast(entry)], offset)?;
        self.label = label.to_string();
        Ok(())
    }

    /// Set access and modification times in Unix seconds
    pub fn utimes(&mut self, node: &NodeRef, atime: i64, mtime: i64) -> Result<(), Error> {
        self.check_writable()?;
        let node = self.node_mut(node);
        node.atime = atime;
        node.mtime = mtime;
        node.is_dirty = true;
        Ok(())
    }

    pub fn update_atime(&mut self, node: &NodeRef) {
        let id = self.resolve(node);
        self.touch_atime(id);
    }

    pub fn update_mtime(&mut self, node: &NodeRef) {
        let id = self.resolve(node);
        self.touch_mtime(id);
    }

    pub(crate) fn touch_atime(&mut self, id: NodeId) {
        let node = &mut self.cache[id];
        node.atime = now();
        node.is_dirty = true;
    }

    pub(crate) fn touch_mtime(&mut self, id: NodeId) {
        let node = &mut self.cache[id];
        node.mtime = now();
        node.is_dirty = true;
    }
}
