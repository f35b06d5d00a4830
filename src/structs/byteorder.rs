use std::fmt::{Debug, Display};

use bytemuck::{Pod, Zeroable};

macro_rules! little_endian {
    ($name:ident, $native:ty, $bytes:literal) => {
        /// Little-endian integer as stored on disk, alignment 1
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
        #[repr(transparent)]
        pub struct $name([u8; $bytes]);

        impl $name {
            pub const fn new(value: $native) -> Self {
                Self(value.to_le_bytes())
            }

            pub const fn get(self) -> $native {
                <$native>::from_le_bytes(self.0)
            }
        }

        impl From<$native> for $name {
            fn from(value: $native) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for $native {
            fn from(value: $name) -> Self {
                value.get()
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:#x}", self.get())
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.get())
            }
        }
    };
}

little_endian!(Le16, u16, 2);
little_endian!(Le32, u32, 4);
little_endian!(Le64, u64, 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_layout() {
        let value = Le32::new(0x11223344);
        assert_eq![bytemuck::bytes_of(&value), &[0x44, 0x33, 0x22, 0x11]];
        assert_eq![std::mem::align_of::<Le64>(), 1];
        let raw = [0xcdu8, 0xab];
        let parsed: Le16 = bytemuck::pod_read_unaligned(&raw);
        assert_eq![parsed.get(), 0xabcd];
        assert_eq![u64::from(Le64::from(u64::MAX - 1)), u64::MAX - 1];
    }
}
