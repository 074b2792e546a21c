//! Metadata ABI shared between the patch builder and the runtime injector.
//!
//! A patch object carries a handful of `.upatch.*` sections. The builder
//! serializes the records defined here; the injector parses them after the
//! patch has been relocated into the target process.

use bitfield_struct::bitfield;

/// Per-function records, one per changed function.
pub const FUNCS_SECTION: &str = ".upatch.funcs";
/// Per-external records, one per symbol that must be resolved in the target.
pub const SYMBOLS_SECTION: &str = ".upatch.symbols";
/// String pool referenced by the record name fields.
pub const STRINGS_SECTION: &str = ".upatch.strings";
/// Patch header, a single [`PatchInfo`] record.
pub const INFO_SECTION: &str = ".upatch.info";
/// Architecture descriptor sections are named `<prefix><arch>`.
pub const ARCH_SECTION_PREFIX: &str = ".upatch.arch.";

/// "1APU" in little-endian byte order.
pub const INFO_MAGIC: u32 = 0x5550_4131;
/// Version stamp of the record layouts below. Bump on any layout change.
pub const FORMAT_VERSION: u32 = 1;

/// Marker bit set in `st_other` of placeholder symbols: the section payload
/// is zeroed and the injector must redirect the symbol into the target
/// process. Chosen outside the visibility bits (0x3) and the PPC64
/// local-entry bits (0xe0).
pub const SYM_OTHER_PLACEHOLDER: u8 = 0x10;

#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct FuncFlags {
    /// Function does not exist in the target binary.
    pub new_func: bool,
    /// Function has `.cold`/`.part` children that travel with it.
    pub has_children: bool,
    #[bits(62)]
    __: u64,
}

/// One record in [`FUNCS_SECTION`].
///
/// `new_addr` and `name` are backed by relocations (against the function
/// symbol and the string pool's section symbol); `old_addr`/`old_size` are
/// resolved at build time from the running binary and stored verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchFunc {
    pub new_addr: u64,
    pub new_size: u64,
    pub old_addr: u64,
    pub old_size: u64,
    pub flags: FuncFlags,
    pub name: u64,
}

impl PatchFunc {
    pub const SIZE: usize = 48;
    /// Field offsets for the builder's relocation entries.
    pub const NEW_ADDR_OFFSET: usize = 0;
    pub const NAME_OFFSET: usize = 40;

    pub fn to_bytes(&self, le: bool) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        put_u64(&mut buf[0..8], self.new_addr, le);
        put_u64(&mut buf[8..16], self.new_size, le);
        put_u64(&mut buf[16..24], self.old_addr, le);
        put_u64(&mut buf[24..32], self.old_size, le);
        put_u64(&mut buf[32..40], self.flags.into_bits(), le);
        put_u64(&mut buf[40..48], self.name, le);
        buf
    }

    pub fn from_bytes(buf: &[u8], le: bool) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(PatchFunc {
            new_addr: get_u64(&buf[0..8], le),
            new_size: get_u64(&buf[8..16], le),
            old_addr: get_u64(&buf[16..24], le),
            old_size: get_u64(&buf[24..32], le),
            flags: FuncFlags::from_bits(get_u64(&buf[32..40], le)),
            name: get_u64(&buf[40..48], le),
        })
    }
}

/// One record in [`SYMBOLS_SECTION`]: a symbol the injector must resolve in
/// the target process. `addr` is the address found in the running binary at
/// build time; `name` is relocation-backed like [`PatchFunc::name`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSymbol {
    pub addr: u64,
    pub name: u64,
}

impl PatchSymbol {
    pub const SIZE: usize = 16;
    pub const NAME_OFFSET: usize = 8;

    pub fn to_bytes(&self, le: bool) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        put_u64(&mut buf[0..8], self.addr, le);
        put_u64(&mut buf[8..16], self.name, le);
        buf
    }

    pub fn from_bytes(buf: &[u8], le: bool) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(PatchSymbol {
            addr: get_u64(&buf[0..8], le),
            name: get_u64(&buf[8..16], le),
        })
    }
}

/// The single record in [`INFO_SECTION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchInfo {
    pub magic: u32,
    pub version: u32,
    pub arch: u32,
    pub nr_funcs: u32,
    pub nr_symbols: u32,
}

impl PatchInfo {
    pub const SIZE: usize = 24;

    pub fn new(arch: u32, nr_funcs: u32, nr_symbols: u32) -> Self {
        PatchInfo {
            magic: INFO_MAGIC,
            version: FORMAT_VERSION,
            arch,
            nr_funcs,
            nr_symbols,
        }
    }

    pub fn to_bytes(&self, le: bool) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        put_u32(&mut buf[0..4], self.magic, le);
        put_u32(&mut buf[4..8], self.version, le);
        put_u32(&mut buf[8..12], self.arch, le);
        put_u32(&mut buf[12..16], self.nr_funcs, le);
        put_u32(&mut buf[16..20], self.nr_symbols, le);
        buf
    }

    pub fn from_bytes(buf: &[u8], le: bool) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let info = PatchInfo {
            magic: get_u32(&buf[0..4], le),
            version: get_u32(&buf[4..8], le),
            arch: get_u32(&buf[8..12], le),
            nr_funcs: get_u32(&buf[12..16], le),
            nr_symbols: get_u32(&buf[16..20], le),
        };
        (info.magic == INFO_MAGIC).then_some(info)
    }
}

fn put_u32(buf: &mut [u8], v: u32, le: bool) {
    let bytes = if le { v.to_le_bytes() } else { v.to_be_bytes() };
    buf.copy_from_slice(&bytes);
}

fn put_u64(buf: &mut [u8], v: u64, le: bool) {
    let bytes = if le { v.to_le_bytes() } else { v.to_be_bytes() };
    buf.copy_from_slice(&bytes);
}

fn get_u32(buf: &[u8], le: bool) -> u32 {
    let bytes: [u8; 4] = buf[..4].try_into().unwrap();
    if le {
        u32::from_le_bytes(bytes)
    } else {
        u32::from_be_bytes(bytes)
    }
}

fn get_u64(buf: &[u8], le: bool) -> u64 {
    let bytes: [u8; 8] = buf[..8].try_into().unwrap();
    if le {
        u64::from_le_bytes(bytes)
    } else {
        u64::from_be_bytes(bytes)
    }
}
