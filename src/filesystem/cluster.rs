use log::{debug, error, info};

use crate::structs::*;
use crate::Error;

use super::{Filesystem, NodeRef};

const FAT_ENTRY_SIZE: u64 = 4;

impl Filesystem {
    /// Absolute byte offset of `cluster`
    pub(crate) fn c2o(&self, cluster: u32) -> u64 {
        self.superblock.cluster_position(cluster)
    }

    fn fat_entry_position(&self, cluster: u32) -> u64 {
        self.superblock.fat_position() + cluster as u64 * FAT_ENTRY_SIZE
    }

    /// Cluster following `cluster` in a chain, contiguous chains are not looked up in the FAT
    pub(crate) fn next_in_chain(&mut self, contiguous: bool, cluster: u32) -> Result<u32, Error> {
        assert!(
            cluster >= FIRST_DATA_CLUSTER,
            "bad cluster {cluster:#x} in chain"
        );
        if contiguous {
            return Ok(cluster + 1);
        }
        let mut buffer = [0u8; FAT_ENTRY_SIZE as usize];
        let position = self.fat_entry_position(cluster);
        self.device.pread(&mut buffer, position).map_err(|e| {
            error!("Failed to read the next cluster after {cluster:#x}: {e}");
            e
        })?;
        Ok(u32::from_le_bytes(buffer))
    }

    /// Cluster following `cluster` in the chain of `node`
    pub(crate) fn next_cluster(&mut self, node: NodeId, cluster: u32) -> Result<u32, Error> {
        let contiguous = self.cache[node].is_contiguous;
        self.next_in_chain(contiguous, cluster)
    }

    /// Cluster with index `count` in the chain of `node`, walked from the cached cursor
    pub(crate) fn advance_cluster(&mut self, id: NodeId, count: u32) -> Result<u32, Error> {
        let node = &mut self.cache[id];
        if node.fptr_index > count {
            node.fptr_index = 0;
            node.fptr_cluster = node.start_cluster;
        }
        let mut cluster = node.fptr_cluster;
        let mut failure = self.superblock.is_cluster_invalid(cluster);
        let mut index = node.fptr_index;
        while !failure && index < count {
            match self.next_cluster(id, cluster) {
                Ok(next) if !self.superblock.is_cluster_invalid(next) => {
                    cluster = next;
                    index += 1;
                }
                Ok(next) => {
                    cluster = next;
                    failure = true;
                }
                Err(_) => failure = true,
            }
        }
        let node = &mut self.cache[id];
        if failure {
            node.fptr_index = 0;
            node.fptr_cluster = node.start_cluster;
            return Err(Error::InvalidCluster(cluster));
        }
        node.fptr_index = count;
        node.fptr_cluster = cluster;
        Ok(cluster)
    }

    /// Store `next` as the successor of `current`, no-op for contiguous chains
    pub(crate) fn set_next_cluster(
        &mut self,
        contiguous: bool,
        current: u32,
        next: u32,
    ) -> Result<(), Error> {
        if contiguous {
            return Ok(());
        }
        let position = self.fat_entry_position(current);
        self.device
            .pwrite(&next.to_le_bytes(), position)
            .map_err(|e| {
                error!("Failed to write the next cluster {next:#x} after {current:#x}: {e}");
                e
            })
    }

    /// Take the first free cluster at or after `hint`, wrapping around the heap
    fn allocate_cluster(&mut self, hint: u32) -> Result<u32, Error> {
        let size = self.cmap.size;
        let mut hint = hint.wrapping_sub(FIRST_DATA_CLUSTER);
        if hint >= size {
            hint = 0;
        }
        self.cmap
            .find_and_set(hint, size)
            .or_else(|| self.cmap.find_and_set(0, hint))
            .ok_or_else(|| {
                error!("No free space left");
                Error::NoSpace
            })
    }

    fn free_cluster(&mut self, cluster: u32) {
        assert!(
            !self.superblock.is_cluster_invalid(cluster),
            "caller must check cluster validity ({cluster:#x})"
        );
        self.cmap.set(cluster - FIRST_DATA_CLUSTER, false);
    }

    /// Write explicit FAT links for a chain that used to be contiguous
    fn make_noncontiguous(&mut self, first: u32, last: u32) -> Result<(), Error> {
        for cluster in first..last {
            self.set_next_cluster(false, cluster, cluster + 1)?;
        }
        Ok(())
    }

    /// Append `difference` clusters to a chain of `current` clusters
    fn grow_file(&mut self, id: NodeId, current: u32, difference: u32) -> Result<(), Error> {
        assert!(difference != 0, "zero clusters count passed");
        let mut allocated = 0;
        let mut previous = if self.cache[id].start_cluster != CLUSTER_FREE {
            self.advance_cluster(id, current - 1).map_err(|e| {
                error!("Invalid cluster while growing: {e}");
                e
            })?
        } else {
            let node = &self.cache[id];
            assert!(
                node.fptr_index == 0,
                "non-zero pointer index ({})",
                node.fptr_index
            );
            let first = self.allocate_cluster(0)?;
            let node = &mut self.cache[id];
            node.start_cluster = first;
            node.fptr_cluster = first;
            // a single cluster is always contiguous
            node.is_contiguous = true;
            allocated = 1;
            first
        };

        while allocated < difference {
            let next = match self.allocate_cluster(previous + 1) {
                Ok(next) => next,
                Err(e) => {
                    if allocated != 0 {
                        if let Err(e) = self.shrink_file(id, current + allocated, allocated) {
                            error!("Failed to release partially allocated clusters: {e}");
                        }
                    }
                    return Err(e);
                }
            };
            if next != previous + 1 && self.cache[id].is_contiguous {
                let start = self.cache[id].start_cluster;
                self.make_noncontiguous(start, previous)?;
                let node = &mut self.cache[id];
                node.is_contiguous = false;
                node.is_dirty = true;
                debug!("Node '{}' is no longer contiguous", node.name());
            }
            let contiguous = self.cache[id].is_contiguous;
            self.set_next_cluster(contiguous, previous, next)?;
            previous = next;
            allocated += 1;
        }

        let contiguous = self.cache[id].is_contiguous;
        self.set_next_cluster(contiguous, previous, CLUSTER_END)
    }

    /// Release the last `difference` clusters of a chain of `current` clusters
    fn shrink_file(&mut self, id: NodeId, current: u32, difference: u32) -> Result<(), Error> {
        assert!(difference != 0, "zero difference passed");
        assert!(
            self.cache[id].start_cluster != CLUSTER_FREE,
            "unable to shrink empty file ({current} clusters)"
        );
        assert!(
            current >= difference,
            "file underflow ({current} < {difference})"
        );
        let contiguous = self.cache[id].is_contiguous;

        let mut previous = if current > difference {
            let last = self.advance_cluster(id, current - difference - 1).map_err(|e| {
                error!("Invalid cluster while shrinking: {e}");
                e
            })?;
            let next = self.next_in_chain(contiguous, last)?;
            self.set_next_cluster(contiguous, last, CLUSTER_END)?;
            next
        } else {
            let node = &mut self.cache[id];
            let first = node.start_cluster;
            node.start_cluster = CLUSTER_FREE;
            node.is_dirty = true;
            first
        };
        let node = &mut self.cache[id];
        node.fptr_index = 0;
        node.fptr_cluster = node.start_cluster;

        for _ in 0..difference {
            if self.superblock.is_cluster_invalid(previous) {
                error!("Invalid cluster {previous:#x} while freeing after shrink");
                return Err(Error::InvalidCluster(previous));
            }
            let next = self.next_in_chain(contiguous, previous)?;
            self.set_next_cluster(contiguous, previous, CLUSTER_FREE)?;
            self.free_cluster(previous);
            previous = next;
        }

        let node = &mut self.cache[id];
        if node.start_cluster == CLUSTER_FREE {
            node.is_contiguous = false;
        }
        Ok(())
    }

    /// Write `size` zero bytes at absolute `offset`
    fn erase_raw(&mut self, size: u64, offset: u64) -> Result<(), Error> {
        assert!(size <= self.zero_cluster.len() as u64);
        self.device
            .pwrite(&self.zero_cluster[..size as usize], offset)
            .map_err(|e| {
                error!("Failed to erase {size} bytes at {offset}: {e}");
                e
            })
    }

    /// Zero bytes `begin..end` of a node's data
    pub(crate) fn erase_range(&mut self, id: NodeId, begin: u64, end: u64) -> Result<(), Error> {
        if begin >= end {
            return Ok(());
        }
        let cluster_size = self.superblock.cluster_size();
        let mut boundary = (begin | (cluster_size - 1)) + 1;
        let index = self.superblock.cluster_index(begin);
        let mut cluster = self.advance_cluster(id, index).map_err(|e| {
            error!("Invalid cluster while erasing: {e}");
            e
        })?;
        self.erase_raw(
            boundary.min(end) - begin,
            self.c2o(cluster) + begin % cluster_size,
        )?;
        while boundary < end {
            cluster = self.next_cluster(id, cluster)?;
            if self.superblock.is_cluster_invalid(cluster) {
                error!("Invalid cluster {cluster:#x} after allocation");
                return Err(Error::InvalidCluster(cluster));
            }
            self.erase_raw(cluster_size, self.c2o(cluster))?;
            boundary += cluster_size;
        }
        Ok(())
    }

    /// Resize a node to `size` bytes.
    /// With `erase` the newly exposed range is zeroed on disk and becomes valid data.
    pub fn truncate(&mut self, node: &NodeRef, size: u64, erase: bool) -> Result<(), Error> {
        let id = self.resolve(node);
        self.resize(id, size, erase)
    }

    pub(crate) fn resize(&mut self, id: NodeId, size: u64, erase: bool) -> Result<(), Error> {
        let node = &self.cache[id];
        assert!(
            node.references() != 0 || node.parent.is_none(),
            "no references, node changes can be lost"
        );
        if node.size == size {
            return Ok(());
        }
        if size > self.superblock.heap_size() {
            error!(
                "Size {size} of '{}' exceeds the cluster heap ({} bytes)",
                node.name(),
                self.superblock.heap_size()
            );
            return Err(Error::NoSpace);
        }
        let c1 = self.superblock.bytes_to_clusters(node.size);
        let c2 = self.superblock.bytes_to_clusters(size);
        if c1 < c2 {
            self.grow_file(id, c1, c2 - c1)?;
        } else if c1 > c2 {
            self.shrink_file(id, c1, c1 - c2)?;
        }

        if erase {
            let valid_size = self.cache[id].valid_size;
            self.erase_range(id, valid_size, size)?;
            self.cache[id].valid_size = size;
        } else {
            let node = &mut self.cache[id];
            node.valid_size = node.valid_size.min(size);
        }

        self.touch_mtime(id);
        let node = &mut self.cache[id];
        node.size = size;
        node.is_dirty = true;
        Ok(())
    }

    /// Size of the root directory found by walking its FAT chain
    pub(crate) fn rootdir_size(&mut self) -> Result<u64, Error> {
        let limit = self.superblock.cluster_count();
        let mut cluster = self.superblock.rootdir_cluster();
        let mut clusters = 0u32;
        loop {
            if clusters == limit {
                error!("Root directory cannot occupy all {clusters} clusters");
                return Err(Error::Corrupted);
            }
            if self.superblock.is_cluster_invalid(cluster) {
                error!("Bad cluster {cluster:#x} while reading root directory");
                return Err(Error::Corrupted);
            }
            cluster = self.next_in_chain(false, cluster)?;
            clusters += 1;
            if cluster == CLUSTER_END {
                break;
            }
        }
        Ok(clusters as u64 * self.superblock.cluster_size())
    }

    /// Write the allocation bitmap back if it changed
    pub fn flush(&mut self) -> Result<(), Error> {
        if !self.cmap.dirty {
            return Ok(());
        }
        let position = self.c2o(self.cmap.start_cluster);
        let bytes = self.cmap.to_bytes();
        self.device.pwrite(&bytes, position).map_err(|e| {
            error!("Failed to write clusters bitmap: {e}");
            e
        })?;
        self.cmap.dirty = false;
        info!("Flushed clusters bitmap");
        Ok(())
    }

    pub fn count_free_clusters(&self) -> u32 {
        self.cmap.count_free()
    }

    /// Inclusive sector ranges holding metadata or allocated clusters.
    /// The first range also covers the boot region and the FAT.
    pub fn used_sectors(&self) -> Vec<(u64, u64)> {
        let tail = (self.superblock.cluster_size() - 1) / self.superblock.sector_size();
        self.cmap
            .used_runs()
            .enumerate()
            .map(|(index, (first, last))| {
                let begin = if index == 0 {
                    0
                } else {
                    self.superblock.cluster_to_sector(first)
                };
                (begin, self.superblock.cluster_to_sector(last) + tail)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::testing::{mount_image, ImageBuilder};

    fn create(fs: &mut Filesystem, path: &str) -> NodeRef {
        fs.mknod(path).unwrap();
        fs.lookup(path).unwrap()
    }

    fn chain(fs: &mut Filesystem, node: &NodeRef) -> Vec<u32> {
        let id = fs.resolve(node);
        let count = fs.superblock.bytes_to_clusters(fs.cache[id].size);
        (0..count)
            .map(|index| fs.advance_cluster(id, index).unwrap())
            .collect()
    }

    fn fat_entry(fs: &mut Filesystem, cluster: u32) -> u32 {
        fs.next_in_chain(false, cluster).unwrap()
    }

    #[test]
    fn contiguous_growth() {
        let mut fs = mount_image(ImageBuilder::default().build());
        let file = create(&mut fs, "/a");
        let free = fs.count_free_clusters();
        fs.truncate(&file, 3 * 512, true).unwrap();
        assert_eq![chain(&mut fs, &file), vec![5, 6, 7]];
        assert![fs.node(&file).is_contiguous()];
        assert_eq![fs.count_free_clusters(), free - 3];
        assert_eq![fs.node(&file).valid_size(), 3 * 512];
    }

    #[test]
    fn gap_breaks_contiguity() {
        let mut fs = mount_image(ImageBuilder::default().build());
        let a = create(&mut fs, "/a");
        let b = create(&mut fs, "/b");
        fs.truncate(&a, 2 * 512, false).unwrap();
        fs.truncate(&b, 512, false).unwrap();
        assert_eq![fs.node(&b).start_cluster(), 7];
        fs.truncate(&a, 3 * 512, false).unwrap();
        assert![!fs.node(&a).is_contiguous()];
        assert![fs.node(&a).is_dirty()];
        assert_eq![chain(&mut fs, &a), vec![5, 6, 8]];
        assert_eq![fat_entry(&mut fs, 5), 6];
        assert_eq![fat_entry(&mut fs, 6), 8];
        assert_eq![fat_entry(&mut fs, 8), CLUSTER_END];
    }

    #[test]
    fn shrink_releases_tail() {
        let mut fs = mount_image(ImageBuilder::default().build());
        let file = create(&mut fs, "/a");
        let free = fs.count_free_clusters();
        fs.truncate(&file, 4 * 512, false).unwrap();
        fs.truncate(&file, 512 + 1, false).unwrap();
        assert_eq![chain(&mut fs, &file), vec![5, 6]];
        assert_eq![fs.count_free_clusters(), free - 2];
        fs.truncate(&file, 0, false).unwrap();
        assert_eq![fs.node(&file).start_cluster(), CLUSTER_FREE];
        assert![!fs.node(&file).is_contiguous()];
        assert_eq![fs.count_free_clusters(), free];
    }

    #[test]
    fn allocation_wraps_around() {
        let mut fs = mount_image(ImageBuilder::default().build());
        let size = fs.cmap.size;
        assert_eq![fs.allocate_cluster(size + FIRST_DATA_CLUSTER - 1).unwrap(), size + 1];
        assert_eq![fs.allocate_cluster(CLUSTER_END).unwrap(), 5];
        assert_eq![fs.allocate_cluster(0).unwrap(), 6];
    }

    #[test]
    fn out_of_space_does_not_leak() {
        let mut fs = mount_image(ImageBuilder::default().build());
        let file = create(&mut fs, "/a");
        let free = fs.count_free_clusters();
        let result = fs.truncate(&file, (free as u64 + 1) * 512, false);
        assert![matches![result, Err(Error::NoSpace)]];
        assert_eq![fs.count_free_clusters(), free];
        assert_eq![fs.node(&file).start_cluster(), CLUSTER_FREE];
        assert_eq![fs.node(&file).size(), 0];
    }

    #[test]
    fn growth_beyond_heap_is_refused() {
        let mut fs = mount_image(ImageBuilder::default().build());
        let file = create(&mut fs, "/b");
        let neighbour = create(&mut fs, "/victim");
        fs.pwrite(&file, b"x", 0).unwrap();
        fs.pwrite(&neighbour, &[0xab; 512], 0).unwrap();
        assert_eq![fs.node(&neighbour).start_cluster(), 6];
        let free = fs.count_free_clusters();

        let offset = (1u64 << 32) * 512 + 10;
        assert![matches![fs.pwrite(&file, b"y", offset), Err(Error::NoSpace)]];
        let heap = fs.superblock.heap_size();
        assert![matches![fs.truncate(&file, heap + 1, true), Err(Error::NoSpace)]];

        assert_eq![fs.node(&file).size(), 1];
        assert_eq![fs.count_free_clusters(), free];
        let mut buffer = [0u8; 512];
        fs.pread(&neighbour, &mut buffer, 0).unwrap();
        assert![buffer.iter().all(|&b| b == 0xab)];
    }

    #[test]
    #[should_panic(expected = "unable to shrink empty file")]
    fn shrink_empty_file() {
        let mut fs = mount_image(ImageBuilder::default().build());
        let file = create(&mut fs, "/a");
        let id = fs.resolve(&file);
        let _ = fs.shrink_file(id, 1, 1);
    }

    #[test]
    fn cursor_moves_both_ways() {
        let mut fs = mount_image(ImageBuilder::default().build());
        let file = create(&mut fs, "/a");
        fs.truncate(&file, 4 * 512, false).unwrap();
        let id = fs.resolve(&file);
        assert_eq![fs.advance_cluster(id, 3).unwrap(), 8];
        assert_eq![fs.cache[id].fptr_index, 3];
        assert_eq![fs.advance_cluster(id, 1).unwrap(), 6];
        assert_eq![fs.advance_cluster(id, 0).unwrap(), 5];
    }

    #[test]
    fn erase_zeroes_data() {
        let mut fs = mount_image(ImageBuilder::default().build());
        let file = create(&mut fs, "/a");
        fs.pwrite(&file, &[0xee; 1024], 0).unwrap();
        let id = fs.resolve(&file);
        fs.erase_range(id, 100, 400).unwrap();
        let mut buffer = vec![0u8; 1024];
        fs.pread(&file, &mut buffer, 0).unwrap();
        assert![buffer[..100].iter().all(|&b| b == 0xee)];
        assert![buffer[100..400].iter().all(|&b| b == 0)];
        assert![buffer[400..].iter().all(|&b| b == 0xee)];
        // whole clusters past the first boundary
        fs.erase_range(id, 500, 600).unwrap();
        fs.pread(&file, &mut buffer, 0).unwrap();
        assert![buffer[500..].iter().all(|&b| b == 0)];
    }

    #[test]
    fn used_sector_runs() {
        let mut fs = mount_image(ImageBuilder::default().build());
        let a = create(&mut fs, "/a");
        let b = create(&mut fs, "/b");
        fs.truncate(&a, 512, false).unwrap();
        fs.truncate(&b, 512, false).unwrap();
        fs.truncate(&a, 0, false).unwrap();
        let heap = fs.superblock.cluster_to_sector(FIRST_DATA_CLUSTER);
        // clusters 2..=4 hold metadata, 6 belongs to b
        assert_eq![fs.used_sectors(), vec![(0, heap + 2), (heap + 4, heap + 4)]];
    }
}
