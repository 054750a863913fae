/// Serialise any [`RegistryTree`] into a minimal `regf` image.
///
/// The output is a single hbin holding every cell, with `lf` subkey lists
/// and `db` segments for large values. It is meant for building evidence
/// fixtures that [`RegfHive`](super::RegfHive) can read back, not for
/// producing hives Windows would mount.
use super::{datetime_to_filetime, RegValue, RegistryTree};

const BASE_BLOCK_SIZE: usize = 4096;
const HBIN_HEADER_SIZE: usize = 32;
const BIG_DATA_SEGMENT: usize = 16_344;
const NO_CELL: u32 = 0xFFFF_FFFF;

const KEY_HIVE_ENTRY: u16 = 0x0004;
const KEY_COMP_NAME: u16 = 0x0020;
const VALUE_COMP_NAME: u16 = 0x0001;

/// Encode `tree` as hive bytes with `embedded_name` in the base block.
pub fn to_regf_bytes<T: RegistryTree>(tree: &T, embedded_name: &str) -> Vec<u8> {
    let mut bins = BinBuilder::new();
    let root = tree.root();
    let root_offset = bins.write_key(tree, &root, true);
    let bins = bins.finish();

    let mut out = vec![0u8; BASE_BLOCK_SIZE];
    out[..4].copy_from_slice(b"regf");
    put_u32(&mut out, 0x04, 1);
    put_u32(&mut out, 0x08, 1);
    put_u32(&mut out, 0x14, 1);
    put_u32(&mut out, 0x18, 5);
    put_u32(&mut out, 0x20, 1);
    put_u32(&mut out, 0x24, root_offset);
    put_u32(&mut out, 0x28, bins.len() as u32);
    // The base block keeps only the last 31 UTF-16 units of the path.
    let units: Vec<u16> = embedded_name.encode_utf16().collect();
    let tail = &units[units.len().saturating_sub(31)..];
    for (i, unit) in tail.iter().enumerate() {
        out[0x30 + i * 2..0x32 + i * 2].copy_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&bins);
    out
}

struct BinBuilder {
    bins: Vec<u8>,
}

impl BinBuilder {
    fn new() -> Self {
        let mut bins = vec![0u8; HBIN_HEADER_SIZE];
        bins[..4].copy_from_slice(b"hbin");
        Self { bins }
    }

    /// Append an allocated cell and return its offset.
    fn alloc(&mut self, content: &[u8]) -> u32 {
        let offset = self.bins.len() as u32;
        let size = (content.len() + 4 + 7) & !7;
        self.bins.extend_from_slice(&(-(size as i32)).to_le_bytes());
        self.bins.extend_from_slice(content);
        self.bins.resize(offset as usize + size, 0);
        offset
    }

    /// Children are written before their parent so the parent's list can
    /// reference them.
    fn write_key<T: RegistryTree>(&mut self, tree: &T, key: &T::Key, is_root: bool) -> u32 {
        let children: Vec<u32> = tree
            .subkeys(key)
            .iter()
            .map(|child| self.write_key(tree, child, false))
            .collect();

        let subkey_list = if children.is_empty() {
            NO_CELL
        } else {
            let mut lf = Vec::with_capacity(4 + children.len() * 8);
            lf.extend_from_slice(b"lf");
            lf.extend_from_slice(&(children.len() as u16).to_le_bytes());
            for off in &children {
                lf.extend_from_slice(&off.to_le_bytes());
                lf.extend_from_slice(&0u32.to_le_bytes());
            }
            self.alloc(&lf)
        };

        let values = tree.values(key);
        let value_offsets: Vec<u32> = values.iter().map(|v| self.write_value(v)).collect();
        let value_list = if value_offsets.is_empty() {
            NO_CELL
        } else {
            let list: Vec<u8> = value_offsets.iter().flat_map(|o| o.to_le_bytes()).collect();
            self.alloc(&list)
        };

        let (name_bytes, compressed) = encode_name(&tree.key_name(key));
        let mut flags = if compressed { KEY_COMP_NAME } else { 0 };
        if is_root {
            flags |= KEY_HIVE_ENTRY;
        }
        let timestamp = tree.timestamp(key).map(datetime_to_filetime).unwrap_or(0);

        let mut nk = vec![0u8; 76];
        nk[..2].copy_from_slice(b"nk");
        nk[2..4].copy_from_slice(&flags.to_le_bytes());
        nk[4..12].copy_from_slice(&timestamp.to_le_bytes());
        nk[20..24].copy_from_slice(&(children.len() as u32).to_le_bytes());
        nk[28..32].copy_from_slice(&subkey_list.to_le_bytes());
        nk[32..36].copy_from_slice(&NO_CELL.to_le_bytes());
        nk[36..40].copy_from_slice(&(values.len() as u32).to_le_bytes());
        nk[40..44].copy_from_slice(&value_list.to_le_bytes());
        nk[44..48].copy_from_slice(&NO_CELL.to_le_bytes());
        nk[48..52].copy_from_slice(&NO_CELL.to_le_bytes());
        nk[72..74].copy_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        nk.extend_from_slice(&name_bytes);
        self.alloc(&nk)
    }

    fn write_value(&mut self, value: &RegValue) -> u32 {
        let (data_len, data_offset) = if value.data.len() <= 4 {
            let mut inline = [0u8; 4];
            inline[..value.data.len()].copy_from_slice(&value.data);
            (
                value.data.len() as u32 | 0x8000_0000,
                u32::from_le_bytes(inline),
            )
        } else if value.data.len() > BIG_DATA_SEGMENT {
            (value.data.len() as u32, self.write_big_data(&value.data))
        } else {
            (value.data.len() as u32, self.alloc(&value.data))
        };

        let (name_bytes, compressed) = encode_name(&value.name);
        let mut vk = vec![0u8; 20];
        vk[..2].copy_from_slice(b"vk");
        vk[2..4].copy_from_slice(&(name_bytes.len() as u16).to_le_bytes());
        vk[4..8].copy_from_slice(&data_len.to_le_bytes());
        vk[8..12].copy_from_slice(&data_offset.to_le_bytes());
        vk[12..16].copy_from_slice(&value.data_type.to_le_bytes());
        let flags: u16 = if compressed { VALUE_COMP_NAME } else { 0 };
        vk[16..18].copy_from_slice(&flags.to_le_bytes());
        vk.extend_from_slice(&name_bytes);
        self.alloc(&vk)
    }

    fn write_big_data(&mut self, data: &[u8]) -> u32 {
        let segments: Vec<u32> = data
            .chunks(BIG_DATA_SEGMENT)
            .map(|chunk| self.alloc(chunk))
            .collect();
        let list: Vec<u8> = segments.iter().flat_map(|o| o.to_le_bytes()).collect();
        let list_offset = self.alloc(&list);

        let mut db = Vec::with_capacity(8);
        db.extend_from_slice(b"db");
        db.extend_from_slice(&(segments.len() as u16).to_le_bytes());
        db.extend_from_slice(&list_offset.to_le_bytes());
        self.alloc(&db)
    }

    fn finish(mut self) -> Vec<u8> {
        let len = (self.bins.len() + BASE_BLOCK_SIZE - 1) / BASE_BLOCK_SIZE * BASE_BLOCK_SIZE;
        self.bins.resize(len, 0);
        let size = len as u32;
        self.bins[8..12].copy_from_slice(&size.to_le_bytes());
        self.bins
    }
}

/// ASCII names are stored compressed; anything else as UTF-16LE.
fn encode_name(name: &str) -> (Vec<u8>, bool) {
    if name.is_ascii() {
        (name.as_bytes().to_vec(), true)
    } else {
        (name.encode_utf16().flat_map(u16::to_le_bytes).collect(), false)
    }
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
