//! In-memory volumes for unit tests

use std::cell::{Cell, RefCell, RefMut};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use bytemuck::Zeroable;

use crate::options::MountOptions;
use crate::structs::*;
use crate::Error;

use super::{BlockDevice, Device, Filesystem};

impl BlockDevice for Cursor<Vec<u8>> {}

/// Image shared between successive mounts, counts device reads
#[derive(Debug, Clone)]
pub(crate) struct SharedImage {
    data: Rc<RefCell<Vec<u8>>>,
    position: u64,
    reads: Rc<Cell<usize>>,
}

impl SharedImage {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Rc::new(RefCell::new(data)),
            position: 0,
            reads: Rc::new(Cell::new(0)),
        }
    }

    pub fn bytes_mut(&self) -> RefMut<'_, Vec<u8>> {
        self.data.borrow_mut()
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }
}

impl Read for SharedImage {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reads.set(self.reads.get() + 1);
        let data = self.data.borrow();
        let start = (self.position as usize).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }
}

impl Write for SharedImage {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut data = self.data.borrow_mut();
        let start = self.position as usize;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for SharedImage {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(offset) => {
                self.position = offset;
                return Ok(offset);
            }
            SeekFrom::End(offset) => (self.data.borrow().len() as u64, offset),
            SeekFrom::Current(offset) => (self.position, offset),
        };
        self.position = base.checked_add_signed(offset).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek before start")
        })?;
        Ok(self.position)
    }
}

impl BlockDevice for SharedImage {}

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn mount_image(image: Vec<u8>) -> Filesystem {
    mount_with(image, "")
}

pub(crate) fn mount_with(image: Vec<u8>, options: &str) -> Filesystem {
    init();
    let options: MountOptions = options.parse().unwrap();
    let device = Device::new(Box::new(Cursor::new(image)), options.mode).unwrap();
    Filesystem::mount(device, options).unwrap()
}

pub(crate) fn mount_shared(image: &SharedImage, options: &str) -> Result<Filesystem, Error> {
    init();
    let options: MountOptions = options.parse()?;
    let device = Device::new(Box::new(image.clone()), options.mode)?;
    Filesystem::mount(device, options)
}

const SECTOR_SIZE: usize = 512;
const SECTOR_COUNT: u64 = 96;
const FAT_SECTOR: u32 = 24;
const FAT_SECTORS: u32 = 8;
const HEAP_SECTOR: u32 = 32;
const CLUSTER_COUNT: u32 = 64;
const BITMAP_CLUSTER: u32 = 2;
const UPCASE_CLUSTER: u32 = 3;
const ROOT_CLUSTER: u32 = 4;

/// Smallest sensible volume: 512-byte clusters, bitmap, ASCII upcase table and root,
/// each one cluster long
#[derive(Debug, Clone)]
pub(crate) struct ImageBuilder {
    label: Option<String>,
    version: (u8, u8),
    state: u16,
    allocated_percent: u8,
    sector_count: u64,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        Self {
            label: None,
            version: (1, 0),
            state: 0,
            allocated_percent: 0,
            sector_count: SECTOR_COUNT,
        }
    }
}

impl ImageBuilder {
    /// Byte offset of the root directory
    pub const ROOT_POSITION: usize = (HEAP_SECTOR + ROOT_CLUSTER - FIRST_DATA_CLUSTER) as usize * SECTOR_SIZE;

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn version(mut self, major: u8, minor: u8) -> Self {
        self.version = (major, minor);
        self
    }

    pub fn state(mut self, state: u16) -> Self {
        self.state = state;
        self
    }

    pub fn allocated_percent(mut self, percent: u8) -> Self {
        self.allocated_percent = percent;
        self
    }

    /// Sector count claimed by the superblock, the image keeps its real size
    pub fn sector_count(mut self, sectors: u64) -> Self {
        self.sector_count = sectors;
        self
    }

    fn superblock(&self) -> Superblock {
        let mut sb = Superblock::zeroed();
        sb.jump = [0xEB, 0x76, 0x90];
        sb.oem_name = *EXFAT_SIGNATURE;
        sb.sector_count = self.sector_count.into();
        sb.fat_sector_start = FAT_SECTOR.into();
        sb.fat_sector_count = FAT_SECTORS.into();
        sb.cluster_sector_start = HEAP_SECTOR.into();
        sb.cluster_count = CLUSTER_COUNT.into();
        sb.rootdir_cluster = ROOT_CLUSTER.into();
        sb.volume_serial = Le32::new(0x1234_5678);
        sb.version_major = self.version.0;
        sb.version_minor = self.version.1;
        sb.volume_state = self.state.into();
        sb.sector_bits = 9;
        sb.spc_bits = 0;
        sb.fat_count = 1;
        sb.drive_no = 0x80;
        sb.allocated_percent = self.allocated_percent;
        sb.boot_signature = BOOT_SIGNATURE.into();
        sb
    }

    fn boot_region(&self, image: &mut [u8]) {
        image[..SECTOR_SIZE].copy_from_slice(bytemuck::bytes_of(&self.superblock()));
        for sector in 1..=8 {
            let end = (sector + 1) * SECTOR_SIZE;
            image[end - 2..end].copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
        }
        let mut checksum = vbr_start_checksum(&image[..SECTOR_SIZE]);
        for sector in 1..VBR_SECTORS as usize {
            checksum = vbr_add_checksum(&image[sector * SECTOR_SIZE..(sector + 1) * SECTOR_SIZE], checksum);
        }
        let position = VBR_SECTORS as usize * SECTOR_SIZE;
        for slot in image[position..position + SECTOR_SIZE].chunks_exact_mut(4) {
            slot.copy_from_slice(&checksum.to_le_bytes());
        }
        let main_region = 12 * SECTOR_SIZE;
        image.copy_within(..main_region, main_region);
    }

    fn cluster_position(cluster: u32) -> usize {
        (HEAP_SECTOR + cluster - FIRST_DATA_CLUSTER) as usize * SECTOR_SIZE
    }

    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; SECTOR_COUNT as usize * SECTOR_SIZE];
        self.boot_region(&mut image);

        let fat = FAT_SECTOR as usize * SECTOR_SIZE;
        let mut fat_entries = vec![0xFFFF_FFF8u32, CLUSTER_END];
        fat_entries.extend([CLUSTER_END; 3]);
        for (index, entry) in fat_entries.iter().enumerate() {
            image[fat + index * 4..fat + index * 4 + 4].copy_from_slice(&entry.to_le_bytes());
        }

        // clusters 2, 3 and 4 are in use
        image[Self::cluster_position(BITMAP_CLUSTER)] = 0b111;

        let mut upcase: Vec<u16> = vec![0xFFFF, 0x61];
        upcase.extend((b'A'..=b'Z').map(u16::from));
        let upcase_bytes: Vec<u8> = upcase.iter().flat_map(|c| c.to_le_bytes()).collect();
        let position = Self::cluster_position(UPCASE_CLUSTER);
        image[position..position + upcase_bytes.len()].copy_from_slice(&upcase_bytes);

        let mut bitmap = BitmapEntry::zeroed();
        bitmap.kind = ENTRY_BITMAP;
        bitmap.start_cluster = BITMAP_CLUSTER.into();
        bitmap.size = (CLUSTER_COUNT as u64).div_ceil(8).into();

        let mut upcase_entry = UpcaseEntry::zeroed();
        upcase_entry.kind = ENTRY_UPCASE;
        upcase_entry.checksum = vbr_add_checksum(&upcase_bytes, 0).into();
        upcase_entry.start_cluster = UPCASE_CLUSTER.into();
        upcase_entry.size = (upcase_bytes.len() as u64).into();

        let root = Self::ROOT_POSITION;
        image[root..root + 32].copy_from_slice(bytemuck::bytes_of(&bitmap));
        image[root + 32..root + 64].copy_from_slice(bytemuck::bytes_of(&upcase_entry));
        if let Some(label) = &self.label {
            let units: Vec<u16> = label.encode_utf16().collect();
            let entry = LabelEntry::new(&units);
            image[root + 64..root + 96].copy_from_slice(bytemuck::bytes_of(&entry));
        }
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_layout() {
        let image = ImageBuilder::default().build();
        assert_eq![image.len(), 96 * 512];
        assert_eq![&image[3..11], EXFAT_SIGNATURE];
        assert_eq![&image[510..512], &[0x55, 0xAA]];
        assert_eq![&image[..12 * 512], &image[12 * 512..24 * 512]];
        assert_eq![image[ImageBuilder::ROOT_POSITION], ENTRY_BITMAP];
        assert_eq![image[ImageBuilder::ROOT_POSITION + 32], ENTRY_UPCASE];
        assert_eq![image[ImageBuilder::ROOT_POSITION + 64], 0];
    }

    #[test]
    fn shared_image_is_shared() {
        let image = SharedImage::new(vec![0u8; 16]);
        let mut writer = image.clone();
        writer.seek(SeekFrom::Start(4)).unwrap();
        writer.write_all(b"exfat").unwrap();
        let mut reader = image.clone();
        let mut buffer = [0u8; 5];
        assert_eq![reader.seek(SeekFrom::End(-12)).unwrap(), 4];
        reader.read_exact(&mut buffer).unwrap();
        assert_eq![&buffer, b"exfat"];
        assert![image.reads() > 0];
        assert![reader.read_exact(&mut [0u8; 16]).is_err()];
    }
}
