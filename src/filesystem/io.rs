use log::error;

use crate::structs::NodeId;
use crate::Error;

use super::{Filesystem, NodeRef};

impl Filesystem {
    /// Read from a node at `offset`, returns the number of bytes read.
    /// Data past the valid size reads as zeros.
    pub fn pread(&mut self, node: &NodeRef, buffer: &mut [u8], offset: u64) -> Result<usize, Error> {
        let id = self.resolve(node);
        self.read_at(id, buffer, offset)
    }

    /// Write to a node at `offset`, growing it as needed
    pub fn pwrite(&mut self, node: &NodeRef, buffer: &[u8], offset: u64) -> Result<usize, Error> {
        let id = self.resolve(node);
        self.write_at(id, buffer, offset)
    }

    pub(crate) fn read_at(&mut self, id: NodeId, buffer: &mut [u8], offset: u64) -> Result<usize, Error> {
        let (size, valid_size, is_directory) = {
            let node = &self.cache[id];
            (node.size, node.valid_size, node.is_directory())
        };
        if offset >= size || buffer.is_empty() {
            return Ok(0);
        }
        let readable = (buffer.len() as u64).min(size - offset) as usize;
        let stored = (readable as u64).min(valid_size.saturating_sub(offset)) as usize;

        if stored > 0 {
            let cluster_size = self.superblock.cluster_size();
            let mut cluster = self
                .advance_cluster(id, self.superblock.cluster_index(offset))
                .map_err(|e| {
                    error!("Invalid cluster while reading: {e}");
                    e
                })?;
            let mut local_offset = offset % cluster_size;
            let mut done = 0;
            while done < stored {
                if self.superblock.is_cluster_invalid(cluster) {
                    error!("Invalid cluster {cluster:#x} while reading");
                    return Err(Error::InvalidCluster(cluster));
                }
                let chunk = ((cluster_size - local_offset) as usize).min(stored - done);
                let position = self.c2o(cluster) + local_offset;
                self.device
                    .pread(&mut buffer[done..done + chunk], position)
                    .map_err(|e| {
                        error!("Failed to read cluster {cluster:#x}: {e}");
                        e
                    })?;
                done += chunk;
                local_offset = 0;
                if done < stored {
                    cluster = self.next_cluster(id, cluster)?;
                }
            }
        }
        buffer[stored..readable].fill(0);

        if !is_directory && !self.read_only && !self.options.noatime {
            self.touch_atime(id);
        }
        Ok(readable)
    }

    pub(crate) fn write_at(&mut self, id: NodeId, buffer: &[u8], offset: u64) -> Result<usize, Error> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if offset > self.cache[id].size {
            self.resize(id, offset, true)?;
        }
        let end = offset + buffer.len() as u64;
        if end > self.cache[id].size {
            self.resize(id, end, false)?;
        }
        if buffer.is_empty() {
            return Ok(0);
        }
        let valid_size = self.cache[id].valid_size;
        if valid_size < offset {
            self.erase_range(id, valid_size, offset)?;
        }

        let cluster_size = self.superblock.cluster_size();
        let mut cluster = self
            .advance_cluster(id, self.superblock.cluster_index(offset))
            .map_err(|e| {
                error!("Invalid cluster while writing: {e}");
                e
            })?;
        let mut local_offset = offset % cluster_size;
        let mut done = 0;
        while done < buffer.len() {
            if self.superblock.is_cluster_invalid(cluster) {
                error!("Invalid cluster {cluster:#x} while writing");
                return Err(Error::InvalidCluster(cluster));
            }
            let chunk = ((cluster_size - local_offset) as usize).min(buffer.len() - done);
            let position = self.c2o(cluster) + local_offset;
            self.device
                .pwrite(&buffer[done..done + chunk], position)
                .map_err(|e| {
                    error!("Failed to write cluster {cluster:#x}: {e}");
                    e
                })?;
            done += chunk;
            local_offset = 0;
            if done < buffer.len() {
                cluster = self.next_cluster(id, cluster)?;
            }
        }

        let node = &mut self.cache[id];
        if node.valid_size < end {
            node.valid_size = end;
            node.is_dirty = true;
        }
        if !node.is_directory() {
            self.touch_mtime(id);
        }
        Ok(buffer.len())
    }
}
