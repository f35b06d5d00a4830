use std::fmt::Display;

use super::*;

const VBR_SKIPPED_BYTES: [usize; 3] = [0x6a, 0x6b, 0x70];

impl Superblock {
    pub fn sector_size(&self) -> u64 {
        1 << self.sector_bits
    }

    pub fn cluster_size(&self) -> u64 {
        1 << (self.sector_bits as u32 + self.spc_bits as u32)
    }

    pub fn cluster_count(&self) -> u32 {
        self.cluster_count.get()
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count.get()
    }

    pub fn rootdir_cluster(&self) -> u32 {
        self.rootdir_cluster.get()
    }

    /// Byte offset of the first FAT entry
    pub fn fat_position(&self) -> u64 {
        (self.fat_sector_start.get() as u64) << self.sector_bits
    }

    /// Bytes addressable through the cluster heap
    pub fn heap_size(&self) -> u64 {
        self.cluster_count() as u64 * self.cluster_size()
    }

    pub fn is_cluster_invalid(&self, cluster: u32) -> bool {
        cluster < FIRST_DATA_CLUSTER || cluster - FIRST_DATA_CLUSTER >= self.cluster_count()
    }

    /// First sector of `cluster`, panics on clusters below the heap
    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        assert!(
            cluster >= FIRST_DATA_CLUSTER,
            "invalid cluster number {cluster:#x}"
        );
        self.cluster_sector_start.get() as u64
            + (((cluster - FIRST_DATA_CLUSTER) as u64) << self.spc_bits)
    }

    pub fn sector_to_cluster(&self, sector: u64) -> u32 {
        ((sector.saturating_sub(self.cluster_sector_start.get() as u64) >> self.spc_bits) as u32)
            + FIRST_DATA_CLUSTER
    }

    /// Absolute byte offset of `cluster`
    pub fn cluster_position(&self, cluster: u32) -> u64 {
        self.cluster_to_sector(cluster) << self.sector_bits
    }

    /// Clusters needed to hold `bytes`, saturates past the largest chain
    pub fn bytes_to_clusters(&self, bytes: u64) -> u32 {
        u32::try_from(bytes.div_ceil(self.cluster_size())).unwrap_or(u32::MAX)
    }

    /// Index of the cluster holding byte `offset` of a chain, saturating
    pub fn cluster_index(&self, offset: u64) -> u32 {
        u32::try_from(offset / self.cluster_size()).unwrap_or(u32::MAX)
    }

    pub fn is_mounted(&self) -> bool {
        self.volume_state.get() & STATE_MOUNTED != 0
    }

    pub(crate) fn set_mounted(&mut self, mounted: bool) {
        let state = self.volume_state.get();
        let state = if mounted {
            state | STATE_MOUNTED
        } else {
            state & !STATE_MOUNTED
        };
        self.volume_state = state.into();
    }

    /// Recompute the allocated space hint unless the creator left it unknown
    pub(crate) fn update_allocated_percent(&mut self, free_clusters: u32) {
        if self.allocated_percent == ALLOCATED_PERCENT_UNKNOWN {
            return;
        }
        let total = self.cluster_count() as u64;
        if total == 0 {
            return;
        }
        let used = total - free_clusters as u64;
        self.allocated_percent = ((used * 100 + total / 2) / total) as u8;
    }
}

/// Checksum of the boot sector, volume state and allocation hint are excluded
pub fn vbr_start_checksum(sector: &[u8]) -> u32 {
    sector
        .iter()
        .enumerate()
        .filter(|(i, _)| !VBR_SKIPPED_BYTES.contains(i))
        .fold(0, |sum, (_, &byte)| add_vbr_byte(sum, byte))
}

/// Continue the VBR checksum over a whole sector
pub fn vbr_add_checksum(sector: &[u8], sum: u32) -> u32 {
    sector.iter().fold(sum, |sum, &byte| add_vbr_byte(sum, byte))
}

fn add_vbr_byte(sum: u32, byte: u8) -> u32 {
    sum.rotate_right(1).wrapping_add(byte as u32)
}

/// Scale `value` to the largest unit that keeps it readable
pub fn humanize_bytes(value: u64) -> (u64, &'static str) {
    const UNITS: [&str; 7] = ["bytes", "KB", "MB", "GB", "TB", "PB", "EB"];
    let mut divisor = 1u64;
    let mut scaled = 0;
    for unit in UNITS {
        scaled = value.saturating_add(divisor / 2) / divisor;
        if scaled == 0 || (scaled % 1024 != 0 && scaled < 10240) {
            return (scaled, unit);
        }
        divisor = divisor.saturating_mul(1024);
    }
    (scaled, UNITS[UNITS.len() - 1])
}

/// Superblock summary together with free space
#[derive(Debug, Clone, Copy)]
pub struct VolumeInfo<'a> {
    pub superblock: &'a Superblock,
    pub free_clusters: u32,
}

impl Display for VolumeInfo<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sb = self.superblock;
        let total = sb.sector_count().saturating_mul(sb.sector_size());
        let available = self.free_clusters as u64 * sb.cluster_size();
        writeln!(
            f,
            "File system version           {}.{}",
            sb.version_major, sb.version_minor
        )?;
        for (title, value) in [
            ("Sector size", sb.sector_size()),
            ("Cluster size", sb.cluster_size()),
            ("Volume size", total),
            ("Used space", total.saturating_sub(available)),
            ("Available space", available),
        ] {
            let (value, unit) = humanize_bytes(value);
            writeln!(f, "{title:<20} {value:>10} {unit}")?;
        }
        Ok(())
    }
}

impl Display for Superblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Version:          {}.{}", self.version_major, self.version_minor)?;
        writeln!(f, "Serial:           {:08x}", self.volume_serial.get())?;
        writeln!(f, "Sector size:      {}", self.sector_size())?;
        writeln!(f, "Cluster size:     {}", self.cluster_size())?;
        writeln!(f, "Sectors:          {}", self.sector_count())?;
        writeln!(
            f,
            "FAT:              {} sectors at {}",
            self.fat_sector_count, self.fat_sector_start
        )?;
        writeln!(
            f,
            "Cluster heap:     {} clusters at sector {}",
            self.cluster_count, self.cluster_sector_start
        )?;
        writeln!(f, "Root directory:   cluster {}", self.rootdir_cluster)?;
        writeln!(f, "State:            {:#06x}", self.volume_state.get())?;
        write!(f, "Allocated:        {}%", self.allocated_percent)
    }
}
