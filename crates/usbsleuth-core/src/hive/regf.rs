/// Reader for offline `regf` hive files.
///
/// The whole file is read into memory once; keys are decoded lazily as the
/// passes walk them.
///
/// ```text
/// +0x0000  base block ("regf", 4096 bytes)
///   +0x24  root cell offset (u32, relative to the first hbin)
///   +0x28  hive bins data length (u32)
///   +0x30  embedded file name (UTF-16LE, 64 bytes)
/// +0x1000  hbin #0 ... cells: |size(i32)|signature|data...|
///          allocated cells carry a negative size
/// ```
use super::{filetime_to_datetime, RegValue, RegistryTree};
use crate::error::HiveError;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::debug;

// ── Constants ────────────────────────────────────────────────────────

const REGF_SIGNATURE: &[u8; 4] = b"regf";
const BASE_BLOCK_SIZE: usize = 4096;

const REGF_ROOT_CELL_OFFSET: usize = 0x24;
const REGF_HIVE_LENGTH: usize = 0x28;
const REGF_FILE_NAME: usize = 0x30;
const REGF_FILE_NAME_LEN: usize = 64;

const NK_FLAGS: usize = 2;
const NK_TIMESTAMP: usize = 4;
const NK_SUBKEY_COUNT: usize = 20;
const NK_SUBKEY_LIST: usize = 28;
const NK_VALUE_COUNT: usize = 36;
const NK_VALUE_LIST: usize = 40;
const NK_NAME_LENGTH: usize = 72;
const NK_NAME_START: usize = 76;

/// Key name is stored as Latin-1 rather than UTF-16LE.
const KEY_COMP_NAME: u16 = 0x0020;

const VK_NAME_LENGTH: usize = 2;
const VK_DATA_LENGTH: usize = 4;
const VK_DATA_OFFSET: usize = 8;
const VK_TYPE: usize = 12;
const VK_FLAGS: usize = 16;
const VK_NAME_START: usize = 20;

const VALUE_COMP_NAME: u16 = 0x0001;
/// Data length high bit: payload lives in the data-offset field itself.
const VK_DATA_RESIDENT: u32 = 0x8000_0000;

/// Values larger than this are split across a `db` segment list.
const BIG_DATA_THRESHOLD: usize = 16_344;

const NO_CELL: u32 = 0xFFFF_FFFF;
/// `ri` lists nest at most one level deep in practice.
const MAX_INDEX_DEPTH: u8 = 4;

/// An opened hive file.
#[derive(Debug, Clone)]
pub struct RegfHive {
    data: Vec<u8>,
    root: RegfKey,
    embedded_name: String,
}

/// A decoded key node.
#[derive(Debug, Clone)]
pub struct RegfKey {
    pub cell_offset: u32,
    pub name: String,
    pub last_written: u64,
    pub subkey_count: u32,
    pub subkey_list: u32,
    pub value_count: u32,
    pub value_list: u32,
}

impl RegfHive {
    pub fn open(path: &Path) -> Result<Self, HiveError> {
        let data = std::fs::read(path).map_err(|source| HiveError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(data)
    }

    /// Parse an in-memory hive image. Fails when the base block is missing
    /// or the root key cannot be decoded.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, HiveError> {
        if data.len() < BASE_BLOCK_SIZE {
            return Err(HiveError::Truncated {
                offset: 0,
                needed: BASE_BLOCK_SIZE,
                available: data.len(),
            });
        }
        if &data[..4] != REGF_SIGNATURE {
            return Err(HiveError::BadSignature);
        }

        let root_offset = read_u32(&data, REGF_ROOT_CELL_OFFSET)?;
        let hive_length = read_u32(&data, REGF_HIVE_LENGTH)?;
        let embedded_name = super::decode_utf16le(
            &data[REGF_FILE_NAME..REGF_FILE_NAME + REGF_FILE_NAME_LEN],
        );
        debug!(
            "regf: root cell {:#x}, bins length {:#x}, name '{}'",
            root_offset, hive_length, embedded_name
        );

        let mut hive = Self {
            data,
            root: RegfKey {
                cell_offset: root_offset,
                name: String::new(),
                last_written: 0,
                subkey_count: 0,
                subkey_list: NO_CELL,
                value_count: 0,
                value_list: NO_CELL,
            },
            embedded_name,
        };
        hive.root = hive.read_key(root_offset)?;
        Ok(hive)
    }

    /// File name recorded in the base block when the hive was last saved.
    pub fn embedded_name(&self) -> &str {
        &self.embedded_name
    }

    /// Contents of the cell at `offset` (after the size prefix).
    fn cell(&self, offset: u32) -> Result<&[u8], HiveError> {
        let start = BASE_BLOCK_SIZE + offset as usize;
        let raw = read_u32(&self.data, start)? as i32;
        let size = raw.unsigned_abs() as usize;
        if size < 8 {
            return Err(HiveError::Truncated {
                offset: start,
                needed: 8,
                available: size,
            });
        }
        let end = start + size;
        if end > self.data.len() {
            return Err(HiveError::Truncated {
                offset: start,
                needed: size,
                available: self.data.len().saturating_sub(start),
            });
        }
        Ok(&self.data[start + 4..end])
    }

    fn signed_cell(&self, offset: u32, expected: &'static str) -> Result<&[u8], HiveError> {
        let cell = self.cell(offset)?;
        let found = [cell[0], cell[1]];
        if &found != expected.as_bytes() {
            return Err(HiveError::BadCell {
                offset,
                expected,
                found,
            });
        }
        Ok(cell)
    }

    fn read_key(&self, offset: u32) -> Result<RegfKey, HiveError> {
        let nk = self.signed_cell(offset, "nk")?;
        let flags = read_u16(nk, NK_FLAGS)?;
        let name_len = read_u16(nk, NK_NAME_LENGTH)? as usize;
        let name_bytes = slice(nk, NK_NAME_START, name_len)?;
        let name = if flags & KEY_COMP_NAME != 0 {
            latin1(name_bytes)
        } else {
            super::decode_utf16le(name_bytes)
        };

        Ok(RegfKey {
            cell_offset: offset,
            name,
            last_written: read_u64(nk, NK_TIMESTAMP)?,
            subkey_count: read_u32(nk, NK_SUBKEY_COUNT)?,
            subkey_list: read_u32(nk, NK_SUBKEY_LIST)?,
            value_count: read_u32(nk, NK_VALUE_COUNT)?,
            value_list: read_u32(nk, NK_VALUE_LIST)?,
        })
    }

    /// Collect key offsets from an `lf`/`lh`/`li`/`ri` list.
    fn collect_subkey_offsets(
        &self,
        list: u32,
        depth: u8,
        out: &mut Vec<u32>,
    ) -> Result<(), HiveError> {
        let cell = self.cell(list)?;
        let count = read_u16(cell, 2)? as usize;
        let entries = &cell[4..];
        match &cell[..2] {
            b"lf" | b"lh" => {
                for entry in entries.chunks_exact(8).take(count) {
                    out.push(read_u32(entry, 0)?);
                }
            }
            b"li" => {
                for entry in entries.chunks_exact(4).take(count) {
                    out.push(read_u32(entry, 0)?);
                }
            }
            b"ri" if depth < MAX_INDEX_DEPTH => {
                for entry in entries.chunks_exact(4).take(count) {
                    self.collect_subkey_offsets(read_u32(entry, 0)?, depth + 1, out)?;
                }
            }
            other => {
                return Err(HiveError::BadCell {
                    offset: list,
                    expected: "lf",
                    found: [other[0], other[1]],
                })
            }
        }
        Ok(())
    }

    fn read_value(&self, offset: u32) -> Result<RegValue, HiveError> {
        let vk = self.signed_cell(offset, "vk")?;
        let name_len = read_u16(vk, VK_NAME_LENGTH)? as usize;
        let data_len = read_u32(vk, VK_DATA_LENGTH)?;
        let data_offset = read_u32(vk, VK_DATA_OFFSET)?;
        let data_type = read_u32(vk, VK_TYPE)?;
        let flags = read_u16(vk, VK_FLAGS)?;

        let name_bytes = slice(vk, VK_NAME_START, name_len)?;
        let name = if flags & VALUE_COMP_NAME != 0 {
            latin1(name_bytes)
        } else {
            super::decode_utf16le(name_bytes)
        };

        let data = if data_len & VK_DATA_RESIDENT != 0 {
            let len = ((data_len & !VK_DATA_RESIDENT) as usize).min(4);
            data_offset.to_le_bytes()[..len].to_vec()
        } else {
            self.read_value_data(data_offset, data_len as usize)?
        };

        Ok(RegValue {
            name,
            data_type,
            data,
        })
    }

    fn read_value_data(&self, offset: u32, len: usize) -> Result<Vec<u8>, HiveError> {
        if len == 0 || offset == NO_CELL {
            return Ok(Vec::new());
        }
        let cell = self.cell(offset)?;
        if len > BIG_DATA_THRESHOLD && &cell[..2] == b"db" {
            let segments = read_u16(cell, 2)? as usize;
            let list = self.cell(read_u32(cell, 4)?)?;
            let mut data = Vec::new();
            for entry in list.chunks_exact(4).take(segments) {
                let segment = self.cell(read_u32(entry, 0)?)?;
                let take = (len - data.len()).min(BIG_DATA_THRESHOLD).min(segment.len());
                data.extend_from_slice(&segment[..take]);
                if data.len() >= len {
                    break;
                }
            }
            return Ok(data);
        }
        Ok(cell[..len.min(cell.len())].to_vec())
    }
}

impl RegistryTree for RegfHive {
    type Key = RegfKey;

    fn root(&self) -> RegfKey {
        self.root.clone()
    }

    fn subkeys(&self, key: &RegfKey) -> Vec<RegfKey> {
        if key.subkey_count == 0 || key.subkey_list == NO_CELL {
            return Vec::new();
        }
        let mut offsets = Vec::new();
        if let Err(err) = self.collect_subkey_offsets(key.subkey_list, 0, &mut offsets) {
            debug!("regf: subkey list of '{}' unreadable: {}", key.name, err);
        }

        offsets
            .into_iter()
            .filter_map(|off| match self.read_key(off) {
                Ok(k) => Some(k),
                Err(err) => {
                    debug!("regf: skipping subkey of '{}': {}", key.name, err);
                    None
                }
            })
            .collect()
    }

    fn values(&self, key: &RegfKey) -> Vec<RegValue> {
        if key.value_count == 0 || key.value_list == NO_CELL {
            return Vec::new();
        }
        let list = match self.cell(key.value_list) {
            Ok(list) => list,
            Err(err) => {
                debug!("regf: value list of '{}' unreadable: {}", key.name, err);
                return Vec::new();
            }
        };

        // The count comes from the file; the list cell bounds it.
        list.chunks_exact(4)
            .take(key.value_count as usize)
            .filter_map(|entry| read_u32(entry, 0).ok())
            .filter_map(|off| match self.read_value(off) {
                Ok(v) => Some(v),
                Err(err) => {
                    debug!("regf: skipping value of '{}': {}", key.name, err);
                    None
                }
            })
            .collect()
    }

    fn key_name(&self, key: &RegfKey) -> String {
        key.name.clone()
    }

    fn timestamp(&self, key: &RegfKey) -> Option<DateTime<Utc>> {
        filetime_to_datetime(key.last_written)
    }
}

// ── Byte helpers ─────────────────────────────────────────────────────

fn slice(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], HiveError> {
    buf.get(offset..offset + len).ok_or(HiveError::Truncated {
        offset,
        needed: len,
        available: buf.len().saturating_sub(offset),
    })
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, HiveError> {
    let b = slice(buf, offset, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

fn read_u32(buf: &[u8], offset: usize) -> Result<u32, HiveError> {
    let b = slice(buf, offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<u64, HiveError> {
    let b = slice(buf, offset, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Ok(u64::from_le_bytes(raw))
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::{writer, MemoryHive};
    use chrono::TimeZone;

    fn sample_tree() -> MemoryHive {
        let mut hive = MemoryHive::new("ROOT");
        let usbstor = hive.add_path("ControlSet001\\Enum\\USBSTOR");
        let class = hive.add_key(usbstor, "Disk&Ven_SanDisk&Prod_Cruzer&Rev_7.01");
        let device = hive.add_key(class, "4C530001230101116474&0");
        hive.set_timestamp(
            device,
            Utc.with_ymd_and_hms(2013, 5, 2, 10, 0, 0).unwrap(),
        );
        hive.set_value(device, RegValue::string("ParentIdPrefix", "7&2a2f3c1&0"));
        hive.set_value(device, RegValue::binary("Tiny", vec![1, 2, 3]));
        hive.set_value(device, RegValue::binary("Large", vec![0x5A; 20_000]));
        hive
    }

    #[test]
    fn reads_back_keys_values_and_timestamps() {
        let bytes = writer::to_regf_bytes(&sample_tree(), "SYSTEM");
        let hive = RegfHive::from_bytes(bytes).unwrap();
        assert_eq!(hive.embedded_name(), "SYSTEM");

        let class = hive
            .open("ControlSet001\\Enum\\USBSTOR\\Disk&Ven_SanDisk&Prod_Cruzer&Rev_7.01")
            .unwrap();
        let devices = hive.subkeys(&class);
        assert_eq!(devices.len(), 1);
        assert_eq!(hive.key_name(&devices[0]), "4C530001230101116474&0");
        assert_eq!(
            hive.timestamp(&devices[0]),
            Some(Utc.with_ymd_and_hms(2013, 5, 2, 10, 0, 0).unwrap())
        );

        let ppid = hive.value(&devices[0], "ParentIdPrefix").unwrap();
        assert_eq!(ppid.as_string().as_deref(), Some("7&2a2f3c1&0"));
        assert_eq!(hive.value(&devices[0], "Tiny").unwrap().data, vec![1, 2, 3]);
        assert_eq!(hive.value(&devices[0], "Large").unwrap().data.len(), 20_000);
    }

    #[test]
    fn oversized_counts_are_bounded_by_their_lists() {
        let mut bytes = writer::to_regf_bytes(&sample_tree(), "SYSTEM");
        let device_offset = {
            let hive = RegfHive::from_bytes(bytes.clone()).unwrap();
            let class = hive
                .open("ControlSet001\\Enum\\USBSTOR\\Disk&Ven_SanDisk&Prod_Cruzer&Rev_7.01")
                .unwrap();
            hive.subkeys(&class)[0].cell_offset
        };
        let root_offset = u32::from_le_bytes(
            bytes[REGF_ROOT_CELL_OFFSET..REGF_ROOT_CELL_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        // nk fields sit after the 4-byte cell size prefix.
        let patch = |bytes: &mut Vec<u8>, cell: u32, field: usize| {
            let at = BASE_BLOCK_SIZE + cell as usize + 4 + field;
            bytes[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        };
        patch(&mut bytes, root_offset, NK_SUBKEY_COUNT);
        patch(&mut bytes, device_offset, NK_VALUE_COUNT);

        let hive = RegfHive::from_bytes(bytes).unwrap();
        let root = hive.root();
        assert_eq!(root.subkey_count, u32::MAX);
        assert_eq!(hive.subkeys(&root).len(), 1);

        let class = hive
            .open("ControlSet001\\Enum\\USBSTOR\\Disk&Ven_SanDisk&Prod_Cruzer&Rev_7.01")
            .unwrap();
        let device = hive.open_from(&class, "4C530001230101116474&0").unwrap();
        assert_eq!(device.value_count, u32::MAX);
        assert_eq!(hive.values(&device).len(), 3);
        assert!(hive.value(&device, "ParentIdPrefix").is_some());
    }

    #[test]
    fn rejects_non_hive_data() {
        let mut bytes = vec![0u8; BASE_BLOCK_SIZE];
        bytes[..4].copy_from_slice(b"MZ\x90\x00");
        assert!(matches!(
            RegfHive::from_bytes(bytes),
            Err(HiveError::BadSignature)
        ));
    }

    #[test]
    fn rejects_short_file() {
        assert!(matches!(
            RegfHive::from_bytes(b"regf".to_vec()),
            Err(HiveError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_root_that_is_not_a_key() {
        let mut bytes = writer::to_regf_bytes(&sample_tree(), "SYSTEM");
        // Point the root at the hbin header, which is not a cell.
        bytes[REGF_ROOT_CELL_OFFSET..REGF_ROOT_CELL_OFFSET + 4]
            .copy_from_slice(&0u32.to_le_bytes());
        assert!(RegfHive::from_bytes(bytes).is_err());
    }
}
