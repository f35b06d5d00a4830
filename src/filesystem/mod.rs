use std::path::Path;

use log::{debug, error, info, warn};

use crate::options::MountOptions;
use crate::structs::time::local_timezone;
use crate::structs::*;
use crate::Error;

mod cache;
mod cluster;
mod device;
mod directory;
mod io;
mod lookup;
mod ops;
mod repair;
#[cfg(test)]
pub(crate) mod testing;

pub use cache::{Cache, NodeRef};
pub use device::{BlockDevice, Device, Mode};
pub use directory::DirCursor;
pub use repair::{Corruption, Decision, Repair, RepairPolicy};

const SUPERBLOCK_SIZE: usize = std::mem::size_of::<Superblock>();
/// Largest supported cluster size as a power of 2
const CLUSTER_BITS_MAX: u32 = 25;

/// Mounted exFAT volume
#[derive(Debug)]
pub struct Filesystem {
    pub(crate) superblock: Superblock,
    pub(crate) device: Device,
    pub(crate) cache: Cache,
    pub(crate) root_id: NodeId,
    /// Reference held on the root for the whole mount
    pub(crate) root_pin: Option<NodeRef>,
    pub(crate) cmap: ClusterMap,
    pub(crate) has_bitmap: bool,
    pub(crate) upcase: Upcase,
    pub(crate) has_upcase: bool,
    pub(crate) label: String,
    pub(crate) options: MountOptions,
    pub(crate) read_only: bool,
    /// Seconds west of UTC, captured at mount
    pub(crate) timezone: i64,
    pub(crate) zero_cluster: Vec<u8>,
    pub(crate) repair: Box<dyn RepairPolicy>,
    pub(crate) errors: u32,
    pub(crate) errors_fixed: u32,
}

/// Attributes of a node as a POSIX frontend reports them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    /// 512-byte blocks, rounded up to whole clusters
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFs {
    /// Cluster size in bytes
    pub block_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

fn read_superblock(device: &mut Device) -> Result<Superblock, Error> {
    let mut buffer = [0u8; SUPERBLOCK_SIZE];
    device.pread(&mut buffer, 0).map_err(|e| {
        error!("Failed to read boot sector: {e}");
        e
    })?;
    Ok(bytemuck::pod_read_unaligned(&buffer))
}

impl Filesystem {
    /// Open the device at `path` and mount it with a comma-separated option string
    pub fn open(path: impl AsRef<Path>, options: &str) -> Result<Self, Error> {
        let options: MountOptions = options.parse()?;
        let device = Device::open(path, options.mode)?;
        Self::mount(device, options)
    }

    /// Mount a volume, corruption is handled according to `options.repair`
    pub fn mount(device: Device, options: MountOptions) -> Result<Self, Error> {
        let repair = Box::new(options.repair);
        Self::mount_with_policy(device, options, repair)
    }

    pub fn mount_with_policy(
        device: Device,
        options: MountOptions,
        repair: Box<dyn RepairPolicy>,
    ) -> Result<Self, Error> {
        let mut device = device;
        let superblock = read_superblock(&mut device)?;
        if &superblock.oem_name != EXFAT_SIGNATURE {
            error!("exFAT file system is not found");
            return Err(Error::NotExfat);
        }
        if superblock.sector_bits < 9 {
            error!("Too small sector size: 2^{}", superblock.sector_bits);
            return Err(Error::Unsupported);
        }
        if superblock.sector_bits as u32 + superblock.spc_bits as u32 > CLUSTER_BITS_MAX {
            error!(
                "Too big cluster size: 2^({}+{})",
                superblock.sector_bits, superblock.spc_bits
            );
            return Err(Error::Unsupported);
        }

        let read_only = device.mode() == Mode::ReadOnly;
        let mut cache = Cache::default();
        let root_id = cache.insert(Node::root(superblock.rootdir_cluster()));
        let mut fs = Self {
            superblock,
            device,
            cache,
            root_id,
            root_pin: None,
            cmap: ClusterMap::new(0, 0),
            has_bitmap: false,
            upcase: Upcase::identity(),
            has_upcase: false,
            label: String::new(),
            options,
            read_only,
            timezone: local_timezone(),
            zero_cluster: vec![0; superblock.cluster_size() as usize],
            repair,
            errors: 0,
            errors_fixed: 0,
        };
        fs.verify_vbr_checksum()?;
        fs.check_geometry()?;

        let size = fs.rootdir_size()?;
        let root = &mut fs.cache[root_id];
        root.size = size;
        root.valid_size = size;
        fs.root_pin = Some(fs.cache.handle(root_id));

        fs.cache_directory(root_id)?;
        if !fs.has_upcase {
            error!("Upcase table is not found");
            return Err(Error::Corrupted);
        }
        if !fs.has_bitmap {
            error!("Clusters bitmap is not found");
            return Err(Error::Corrupted);
        }

        if fs.superblock.is_mounted() {
            warn!("Volume was not unmounted cleanly");
        }
        if !fs.read_only {
            fs.superblock.set_mounted(true);
            fs.commit_superblock()?;
        }
        info!(
            "Mounted {} volume with {} clusters of {} bytes",
            if fs.read_only { "read-only" } else { "read-write" },
            fs.superblock.cluster_count(),
            fs.superblock.cluster_size()
        );
        Ok(fs)
    }

    fn check_geometry(&self) -> Result<(), Error> {
        let sb = &self.superblock;
        if sb.version_major != 1 || sb.version_minor != 0 {
            error!(
                "Unsupported exFAT version: {}.{}",
                sb.version_major, sb.version_minor
            );
            return Err(Error::Unsupported);
        }
        if sb.fat_count != 1 {
            error!("Unsupported FAT count: {}", sb.fat_count);
            return Err(Error::Unsupported);
        }
        let device_size = self.device.size();
        let claimed = sb.sector_count().checked_mul(sb.sector_size());
        if claimed.map_or(true, |size| size > device_size) {
            warn!(
                "File system in sectors is larger than device: {} * {} > {}",
                sb.sector_count(),
                sb.sector_size(),
                device_size
            );
        }
        if sb.heap_size() > device_size {
            error!(
                "File system in clusters is larger than device: {} * {} > {}",
                sb.cluster_count(),
                sb.cluster_size(),
                device_size
            );
            return Err(Error::Corrupted);
        }
        Ok(())
    }

    /// Check the boot region against its checksum sector
    fn verify_vbr_checksum(&mut self) -> Result<(), Error> {
        let sector_size = self.superblock.sector_size();
        let mut sector = vec![0u8; sector_size as usize];
        self.device.pread(&mut sector, 0)?;
        let mut checksum = vbr_start_checksum(&sector);
        for index in 1..VBR_SECTORS {
            self.device.pread(&mut sector, index * sector_size)?;
            checksum = vbr_add_checksum(&sector, checksum);
        }
        let position = VBR_SECTORS * sector_size;
        self.device.pread(&mut sector, position)?;

        let stored = sector
            .chunks_exact(4)
            .map(|slot| bytemuck::pod_read_unaligned::<Le32>(slot).get())
            .find(|&slot| slot != checksum);
        let Some(stored) = stored else {
            return Ok(());
        };
        error!("Invalid VBR checksum {stored:#x} (expected {checksum:#x})");
        let corruption = Corruption::VbrChecksum {
            stored,
            computed: checksum,
        };
        match self.ask_to_fix(corruption) {
            Decision::Fix => {
                for slot in sector.chunks_exact_mut(4) {
                    slot.copy_from_slice(&checksum.to_le_bytes());
                }
                self.device.pwrite(&sector, position)?;
                self.errors_fixed += 1;
                info!("VBR checksum fixed");
                Ok(())
            }
            Decision::Accept => Ok(()),
            Decision::Reject => Err(Error::Corrupted),
        }
    }

    /// Write the in-core superblock to the boot sector and make it durable
    pub(crate) fn commit_superblock(&mut self) -> Result<(), Error> {
        self.device
            .pwrite(bytemuck::bytes_of(&self.superblock), 0)
            .map_err(|e| {
                error!("Failed to write superblock: {e}");
                e
            })?;
        self.device.fsync()
    }

    /// Flush everything, clear the mounted state and release the device
    pub fn unmount(mut self) -> Result<Device, Error> {
        if let Err(e) = self.flush_nodes() {
            error!("Failed to flush nodes at unmount: {e}");
        }
        if let Err(e) = self.flush() {
            error!("Failed to flush clusters bitmap at unmount: {e}");
        }
        self.root_pin = None;
        self.reset_cache();
        if !self.read_only {
            self.superblock.set_mounted(false);
            let free = self.count_free_clusters();
            self.superblock.update_allocated_percent(free);
            self.commit_superblock()?;
        }
        debug!("Unmounted volume");
        Ok(self.device)
    }

    /// Write back dirty nodes and the bitmap, then sync the device
    pub fn sync(&mut self) -> Result<(), Error> {
        self.flush_nodes()?;
        self.flush()?;
        self.device.fsync()
    }

    pub(crate) fn check_writable(&self) -> Result<(), Error> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    /// Volume label, empty if there is none
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn info(&self) -> VolumeInfo<'_> {
        VolumeInfo {
            superblock: &self.superblock,
            free_clusters: self.count_free_clusters(),
        }
    }

    pub fn stat(&self, node: &NodeRef) -> Stat {
        let node = self.node(node);
        let mode = if node.is_directory() {
            libc::S_IFDIR as u32 | (0o777 & !self.options.dmask)
        } else {
            libc::S_IFREG as u32 | (0o777 & !self.options.fmask)
        };
        let cluster_size = self.superblock.cluster_size();
        Stat {
            mode,
            nlink: 1,
            uid: self.options.uid,
            gid: self.options.gid,
            size: node.size,
            blocks: node.size.next_multiple_of(cluster_size) >> 9,
            atime: node.atime,
            mtime: node.mtime,
            ctime: node.mtime,
        }
    }

    pub fn statfs(&self) -> StatFs {
        let blocks = self.superblock.sector_count() >> self.superblock.spc_bits;
        let free = self.count_free_clusters() as u64;
        StatFs {
            block_size: self.superblock.cluster_size(),
            blocks,
            blocks_free: free,
            files: blocks,
            files_free: free,
            name_max: NAME_MAX as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::testing::{mount_image, mount_shared, mount_with, ImageBuilder, SharedImage};

    const STATE_OFFSET: usize = 0x6a;
    const PERCENT_OFFSET: usize = 0x70;

    #[test]
    fn rejects_foreign_volumes() {
        let mut image = ImageBuilder::default().build();
        image[3..11].copy_from_slice(b"NTFS    ");
        let image = SharedImage::new(image);
        assert![matches![mount_shared(&image, ""), Err(Error::NotExfat)]];

        let image = SharedImage::new(ImageBuilder::default().version(2, 0).build());
        assert![matches![mount_shared(&image, ""), Err(Error::Unsupported)]];
    }

    #[test]
    fn heap_larger_than_device() {
        let mut image = ImageBuilder::default().build();
        // shorter than the 64 clusters of the heap
        image.truncate(60 * 512);
        let image = SharedImage::new(image);
        assert![matches![mount_shared(&image, ""), Err(Error::Corrupted)]];
    }

    #[test]
    fn sector_count_beyond_device() {
        let image = ImageBuilder::default().sector_count(1 << 60).build();
        let fs = mount_image(image);
        assert_eq![fs.superblock().sector_count(), 1 << 60];
        assert![fs.info().to_string().contains("File system version")];
        let image = ImageBuilder::default().sector_count(u64::MAX).build();
        mount_image(image).unmount().unwrap();
    }

    #[test]
    fn missing_upcase_table() {
        let mut image = ImageBuilder::default().build();
        let root = ImageBuilder::ROOT_POSITION;
        // upcase entry is the second one in the root
        image[root + 32] &= !ENTRY_VALID;
        let image = SharedImage::new(image);
        assert![matches![mount_shared(&image, ""), Err(Error::Corrupted)]];
    }

    #[test]
    fn mounted_state_is_tracked() {
        let image = SharedImage::new(ImageBuilder::default().build());
        let fs = mount_shared(&image, "").unwrap();
        assert_eq![image.bytes_mut()[STATE_OFFSET] & STATE_MOUNTED as u8, STATE_MOUNTED as u8];
        fs.unmount().unwrap();
        assert_eq![image.bytes_mut()[STATE_OFFSET] & STATE_MOUNTED as u8, 0];
    }

    #[test]
    fn unclean_volume_still_mounts() {
        let image = SharedImage::new(ImageBuilder::default().state(STATE_MOUNTED).build());
        let fs = mount_shared(&image, "").unwrap();
        assert![fs.superblock().is_mounted()];
        fs.unmount().unwrap();
        assert_eq![image.bytes_mut()[STATE_OFFSET], 0];
    }

    #[test]
    fn allocated_percent_on_unmount() {
        let image = SharedImage::new(ImageBuilder::default().allocated_percent(0).build());
        let mut fs = mount_shared(&image, "").unwrap();
        fs.mknod("/big").unwrap();
        let file = fs.lookup("/big").unwrap();
        // 3 metadata clusters plus 29 of data make half of 64
        fs.truncate(&file, 29 * 512, true).unwrap();
        drop(file);
        fs.unmount().unwrap();
        assert_eq![image.bytes_mut()[PERCENT_OFFSET], 50];

        let image = SharedImage::new(
            ImageBuilder::default()
                .allocated_percent(ALLOCATED_PERCENT_UNKNOWN)
                .build(),
        );
        mount_shared(&image, "").unwrap().unmount().unwrap();
        assert_eq![image.bytes_mut()[PERCENT_OFFSET], ALLOCATED_PERCENT_UNKNOWN];
    }

    #[test]
    fn vbr_checksum_follows_policy() {
        let image = SharedImage::new(ImageBuilder::default().build());
        let checksum_position = VBR_SECTORS as usize * 512;
        image.bytes_mut()[checksum_position + 100] ^= 0xff;
        assert![matches![mount_shared(&image, ""), Err(Error::Corrupted)]];
        assert![matches![mount_shared(&image, "ro,repair=2"), Err(Error::Corrupted)]];

        let fs = mount_shared(&image, "repair=2").unwrap();
        assert_eq![fs.errors(), 1];
        assert_eq![fs.errors_fixed(), 1];
        fs.unmount().unwrap();
        let fs = mount_shared(&image, "").unwrap();
        assert_eq![fs.errors(), 0];
    }

    #[test]
    fn read_only_mount_leaves_image_untouched() {
        let pristine = ImageBuilder::default().label("SNAPSHOT").build();
        let image = SharedImage::new(pristine.clone());
        let mut fs = mount_shared(&image, "ro").unwrap();
        assert![fs.is_read_only()];
        let root = fs.root();
        let mut cursor = fs.opendir(&root).unwrap();
        assert![fs.readdir(&mut cursor).is_none()];
        fs.closedir(cursor).unwrap();
        drop(root);
        fs.sync().unwrap();
        fs.unmount().unwrap();
        assert_eq![*image.bytes_mut(), pristine];
    }

    #[test]
    fn node_attributes() {
        let mut fs = mount_with(ImageBuilder::default().build(), "uid=1000,gid=100,umask=022,fmask=137");
        fs.mkdir("/dir").unwrap();
        fs.mknod("/file").unwrap();
        let dir = fs.lookup("/dir").unwrap();
        let file = fs.lookup("/file").unwrap();
        fs.pwrite(&file, &[1; 100], 0).unwrap();
        fs.utimes(&file, 10, 20).unwrap();

        let stat = fs.stat(&dir);
        assert_eq![stat.mode, libc::S_IFDIR as u32 | 0o755];
        assert_eq![stat.size, 512];
        assert_eq![stat.blocks, 1];
        let stat = fs.stat(&file);
        assert_eq![stat.mode, libc::S_IFREG as u32 | 0o640];
        assert_eq![(stat.uid, stat.gid, stat.nlink), (1000, 100, 1)];
        assert_eq![stat.size, 100];
        assert_eq![stat.blocks, 1];
        assert_eq![(stat.atime, stat.mtime, stat.ctime), (10, 20, 20)];
    }

    #[test]
    fn volume_statistics() {
        let mut fs = mount_image(ImageBuilder::default().build());
        let statfs = fs.statfs();
        assert_eq![statfs.block_size, 512];
        assert_eq![statfs.blocks, 96];
        assert_eq![statfs.blocks_free, 61];
        assert_eq![statfs.files_free, 61];
        assert_eq![statfs.name_max, 255];
        fs.mkdir("/dir").unwrap();
        assert_eq![fs.statfs().blocks_free, 60];
        assert![fs.info().to_string().contains("Cluster size")];
    }
}
