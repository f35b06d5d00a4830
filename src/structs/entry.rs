use log::error;

use super::*;

impl Entry {
    pub fn decode(raw: RawEntry) -> Self {
        match raw.kind {
            ENTRY_BITMAP => Self::Bitmap(bytemuck::cast(raw)),
            ENTRY_UPCASE => Self::Upcase(bytemuck::cast(raw)),
            ENTRY_LABEL => Self::Label(bytemuck::cast(raw)),
            ENTRY_FILE => Self::File(bytemuck::cast(raw)),
            ENTRY_FILE_INFO => Self::FileInfo(bytemuck::cast(raw)),
            ENTRY_FILE_NAME => Self::FileName(bytemuck::cast(raw)),
            _ => Self::Other(raw),
        }
    }

    pub fn encode(&self) -> RawEntry {
        match *self {
            Self::Bitmap(e) => bytemuck::cast(e),
            Self::Upcase(e) => bytemuck::cast(e),
            Self::Label(e) => bytemuck::cast(e),
            Self::File(e) => bytemuck::cast(e),
            Self::FileInfo(e) => bytemuck::cast(e),
            Self::FileName(e) => bytemuck::cast(e),
            Self::Other(e) => e,
        }
    }

    pub fn kind(&self) -> u8 {
        self.encode().kind
    }
}

impl RawEntry {
    /// Entry with the in-use bit cleared
    pub fn deleted(mut self) -> Self {
        self.kind &= !ENTRY_VALID;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.kind & ENTRY_VALID != 0
    }

    /// Primary entries that may be ignored when not understood, like the volume GUID
    pub fn is_benign_primary(&self) -> bool {
        self.is_valid() && self.kind & ENTRY_CONTINUED == 0 && self.kind & ENTRY_OPTIONAL != 0
    }
}

impl LabelEntry {
    pub fn new(label: &[u16]) -> Self {
        assert!(label.len() <= ENAME_MAX);
        let mut entry = Self {
            kind: ENTRY_LABEL,
            length: label.len() as u8,
            name: [Le16::default(); ENAME_MAX],
        };
        for (unit, &c) in entry.name.iter_mut().zip(label) {
            *unit = c.into();
        }
        if label.is_empty() {
            entry.kind &= !ENTRY_VALID;
        }
        entry
    }

    pub fn label(&self) -> Vec<u16> {
        self.name[..self.length.min(ENAME_MAX as u8) as usize]
            .iter()
            .map(|c| c.get())
            .collect()
    }
}

/// Entries needed for a name of `length` units
pub fn name_entry_count(length: usize) -> usize {
    length.div_ceil(ENAME_MAX)
}

/// Split `name` over FILE_NAME entries, the last one zero padded
pub fn name_entries(name: &[u16]) -> Vec<RawEntry> {
    name.chunks(ENAME_MAX)
        .map(|chunk| {
            let mut entry = NameEntry {
                kind: ENTRY_FILE_NAME,
                __unknown: 0,
                name: [Le16::default(); ENAME_MAX],
            };
            for (unit, &c) in entry.name.iter_mut().zip(chunk) {
                *unit = c.into();
            }
            bytemuck::cast(entry)
        })
        .collect()
}

/// Collect `length` name units from FILE_NAME entries
pub fn read_name(entries: &[RawEntry], length: usize) -> Vec<u16> {
    entries
        .iter()
        .map(|&raw| bytemuck::cast::<RawEntry, NameEntry>(raw))
        .flat_map(|entry| entry.name)
        .map(Le16::get)
        .take(length)
        .collect()
}

/// Checksum of an entry set, the checksum field of the first entry excluded
pub fn entry_set_checksum(entries: &[RawEntry]) -> u16 {
    let mut sum = 0u16;
    for (index, entry) in entries.iter().enumerate() {
        for (offset, &byte) in bytemuck::bytes_of(entry).iter().enumerate() {
            if index == 0 && (offset == 2 || offset == 3) {
                continue;
            }
            sum = sum.rotate_right(1).wrapping_add(byte as u16);
        }
    }
    sum
}

/// Recompute and store the checksum of a FILE entry set
pub fn seal_entry_set(entries: &mut [RawEntry]) {
    let checksum = entry_set_checksum(entries);
    let mut file: FileEntry = bytemuck::cast(entries[0]);
    file.checksum = checksum.into();
    entries[0] = bytemuck::cast(file);
}

/// Validate the entry type sequence of a file entry set:
/// FILE, FILE_INFO, one or more FILE_NAME, then only optional entries
pub fn check_entries(entries: &[RawEntry]) -> bool {
    let count = entries.len();
    let mut previous: Option<u8> = None;
    let kinds = entries
        .iter()
        .map(|entry| Some(entry.kind))
        .chain(std::iter::once(None));
    for (index, current) in kinds.enumerate() {
        let is_tail = |kind: Option<u8>| kind.map_or(false, |k| k >= ENTRY_FILE_TAIL);
        let valid = match previous {
            None => current == Some(ENTRY_FILE),
            Some(ENTRY_FILE) => current == Some(ENTRY_FILE_INFO),
            Some(ENTRY_FILE_INFO) => current == Some(ENTRY_FILE_NAME),
            Some(ENTRY_FILE_NAME) => {
                current.is_none() || current == Some(ENTRY_FILE_NAME) || is_tail(current)
            }
            Some(kind) if kind >= ENTRY_FILE_TAIL => current.is_none() || is_tail(current),
            Some(_) => false,
        };
        if !valid {
            error!(
                "Unexpected entry type {:#x} after {:#x} at {index}/{count}",
                current.unwrap_or(0),
                previous.unwrap_or(0)
            );
            return false;
        }
        previous = current;
    }
    true
}

#[cfg(test)]
mod tests {
    use bytemuck::Zeroable;

    use super::*;

    fn raw(kind: u8) -> RawEntry {
        RawEntry {
            kind,
            data: [0; 31],
        }
    }

    #[test]
    fn layout_sizes() {
        assert_eq![std::mem::size_of::<Superblock>(), 512];
        for size in [
            std::mem::size_of::<RawEntry>(),
            std::mem::size_of::<FileEntry>(),
            std::mem::size_of::<FileInfoEntry>(),
            std::mem::size_of::<NameEntry>(),
            std::mem::size_of::<BitmapEntry>(),
            std::mem::size_of::<UpcaseEntry>(),
            std::mem::size_of::<LabelEntry>(),
        ] {
            assert_eq![size as u64, ENTRY_SIZE];
        }
    }

    #[test]
    fn decode_by_type() {
        let mut info = FileInfoEntry::zeroed();
        info.kind = ENTRY_FILE_INFO;
        info.start_cluster = 9u32.into();
        info.size = 4096u64.into();
        let encoded = Entry::FileInfo(info).encode();
        assert_eq![bytemuck::bytes_of(&encoded)[20..24], [9, 0, 0, 0]];
        assert_eq![Entry::decode(encoded), Entry::FileInfo(info)];
        assert![matches![Entry::decode(raw(0x05)), Entry::Other(_)]];
        assert![matches![Entry::decode(raw(0xA0)), Entry::Other(_)]];
        assert![raw(0xA0).is_benign_primary()];
        assert![!raw(ENTRY_FILE_TAIL).is_benign_primary()];
        assert_eq![raw(ENTRY_FILE).deleted().kind, 0x05];
    }

    #[test]
    fn checksum_skips_its_own_field() {
        let mut entries = [raw(ENTRY_FILE)];
        assert_eq![entry_set_checksum(&entries), 0x0428];
        entries[0].data[1] = 0xff;
        entries[0].data[2] = 0xee;
        assert_eq![entry_set_checksum(&entries), 0x0428];
        seal_entry_set(&mut entries);
        let file: FileEntry = bytemuck::cast(entries[0]);
        assert_eq![file.checksum.get(), 0x0428];
        let second = [raw(ENTRY_FILE), raw(ENTRY_FILE_INFO)];
        assert_ne![entry_set_checksum(&second), 0x0428];
    }

    #[test]
    fn entry_transitions() {
        let set = [
            raw(ENTRY_FILE),
            raw(ENTRY_FILE_INFO),
            raw(ENTRY_FILE_NAME),
            raw(ENTRY_FILE_NAME),
        ];
        assert![check_entries(&set)];
        assert![check_entries(&[
            raw(ENTRY_FILE),
            raw(ENTRY_FILE_INFO),
            raw(ENTRY_FILE_NAME),
            raw(ENTRY_FILE_TAIL),
            raw(0xE1),
        ])];
        assert![!check_entries(&[])];
        assert![!check_entries(&set[..2])];
        assert![!check_entries(&[raw(ENTRY_FILE_INFO)])];
        assert![!check_entries(&[
            raw(ENTRY_FILE),
            raw(ENTRY_FILE_INFO),
            raw(ENTRY_FILE_NAME),
            raw(ENTRY_FILE_TAIL),
            raw(ENTRY_FILE_NAME),
        ])];
        assert![!check_entries(&[
            raw(ENTRY_FILE),
            raw(ENTRY_FILE_NAME),
            raw(ENTRY_FILE_INFO),
        ])];
    }

    #[test]
    fn names_across_entries() {
        let name: Vec<u16> = "a file name longer than fifteen".encode_utf16().collect();
        let entries = name_entries(&name);
        assert_eq![entries.len(), name_entry_count(name.len())];
        assert_eq![entries.len(), 3];
        assert![entries.iter().all(|e| e.kind == ENTRY_FILE_NAME)];
        assert_eq![read_name(&entries, name.len()), name];
        assert_eq![read_name(&entries, 3), &name[..3]];
    }

    #[test]
    fn label_entry() {
        let label: Vec<u16> = "DATA".encode_utf16().collect();
        let entry = LabelEntry::new(&label);
        assert_eq![entry.kind, ENTRY_LABEL];
        assert_eq![entry.label(), label];
        assert_eq![LabelEntry::new(&[]).kind, 0x03];
    }
}
