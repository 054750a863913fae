/// Registry-tree access: the seam between the correlation passes and
/// whatever actually stores the hive.
///
/// The passes only ever talk to the [`RegistryTree`] trait. Two backends
/// implement it:
///
/// - [`regf::RegfHive`]: an on-disk `regf` hive file read into memory.
/// - [`memory::MemoryHive`]: an arena-backed tree built in code.
///
/// [`writer`] goes the other way and serialises a tree into `regf` bytes.
///
/// Lookups return `Option`/`Vec`. A missing key or value is "no data from
/// this source", never an error.
pub mod memory;
pub mod regf;
pub mod writer;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use memory::{KeyIndex, MemoryHive};
pub use regf::{RegfHive, RegfKey};

pub const REG_SZ: u32 = 1;
pub const REG_EXPAND_SZ: u32 = 2;
pub const REG_BINARY: u32 = 3;
pub const REG_MULTI_SZ: u32 = 7;
pub const REG_QWORD: u32 = 11;
pub const REG_FILETIME: u32 = 0x10;

/// Device-property values are stored with the `DEVPROP_TYPE_*` id in the
/// low word and `0xFFFF` in the high word.
pub const DEVPROP_FILETIME: u32 = 0xFFFF_0010;

/// 100-ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH_SECS: i64 = 11_644_473_600;
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// A single registry value with its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegValue {
    /// Value name. The empty string is the key's default value.
    pub name: String,
    /// Raw `REG_*` type id.
    pub data_type: u32,
    pub data: Vec<u8>,
}

impl RegValue {
    /// A `REG_SZ` value, encoded as NUL-terminated UTF-16LE.
    pub fn string(name: &str, text: &str) -> Self {
        let mut data: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
        data.extend_from_slice(&[0, 0]);
        Self {
            name: name.to_string(),
            data_type: REG_SZ,
            data,
        }
    }

    /// A `REG_BINARY` value.
    pub fn binary(name: &str, data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            data_type: REG_BINARY,
            data,
        }
    }

    /// A device-property FILETIME value as written under `Properties`.
    pub fn filetime(name: &str, when: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            data_type: DEVPROP_FILETIME,
            data: datetime_to_filetime(when).to_le_bytes().to_vec(),
        }
    }

    /// Decode string-typed data. `REG_MULTI_SZ` yields its first string.
    pub fn as_string(&self) -> Option<String> {
        match self.data_type {
            REG_SZ | REG_EXPAND_SZ | REG_MULTI_SZ => Some(decode_utf16le(&self.data)),
            _ => None,
        }
    }

    /// Interpret an 8-byte payload as a FILETIME.
    pub fn as_filetime(&self) -> Option<DateTime<Utc>> {
        let accepted = matches!(
            self.data_type,
            REG_BINARY | REG_QWORD | REG_FILETIME | DEVPROP_FILETIME
        );
        if !accepted || self.data.len() != 8 {
            return None;
        }
        let raw: [u8; 8] = self.data[..8].try_into().ok()?;
        filetime_to_datetime(u64::from_le_bytes(raw))
    }

    /// The payload with every byte outside `1..=127` dropped.
    ///
    /// `MountedDevices` data is either UTF-16LE text or a binary
    /// signature/offset pair; stripping NULs and high bytes turns the
    /// former into plain ASCII for substring matching.
    pub fn ascii_payload(&self) -> String {
        self.data
            .iter()
            .filter(|b| (1..=127).contains(*b))
            .map(|&b| b as char)
            .collect()
    }
}

/// Read access to a hive's key tree.
///
/// `Key` is a cheap handle; backends decide what it carries. Path lookups
/// are backslash-separated and case-insensitive, matching how Windows
/// resolves registry paths.
pub trait RegistryTree {
    type Key: Clone;

    fn root(&self) -> Self::Key;
    fn subkeys(&self, key: &Self::Key) -> Vec<Self::Key>;
    fn values(&self, key: &Self::Key) -> Vec<RegValue>;
    fn key_name(&self, key: &Self::Key) -> String;
    /// Last-write time of the key, if the backend recorded one.
    fn timestamp(&self, key: &Self::Key) -> Option<DateTime<Utc>>;

    fn subkey(&self, key: &Self::Key, name: &str) -> Option<Self::Key> {
        self.subkeys(key)
            .into_iter()
            .find(|k| self.key_name(k).eq_ignore_ascii_case(name))
    }

    fn open_from(&self, key: &Self::Key, path: &str) -> Option<Self::Key> {
        let mut current = key.clone();
        for component in path.split('\\').filter(|c| !c.is_empty()) {
            current = self.subkey(&current, component)?;
        }
        Some(current)
    }

    fn open(&self, path: &str) -> Option<Self::Key> {
        self.open_from(&self.root(), path)
    }

    /// Look up a value by name. `""` and `"(default)"` both select the
    /// default value.
    fn value(&self, key: &Self::Key, name: &str) -> Option<RegValue> {
        let wanted = if name.eq_ignore_ascii_case("(default)") {
            ""
        } else {
            name
        };
        self.values(key)
            .into_iter()
            .find(|v| v.name.eq_ignore_ascii_case(wanted))
    }
}

/// Which role a hive plays in the correlation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HiveKind {
    System,
    Software,
    NtUser,
    Other,
}

impl HiveKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::Software => "SOFTWARE",
            Self::NtUser => "NTUSER",
            Self::Other => "other",
        }
    }
}

/// Classify a hive from the file name embedded in its base block, falling
/// back to the shape of its root key.
///
/// The embedded name is the tail of the path the hive was loaded from on
/// the live system (e.g. `\??\C:\Windows\System32\config\SYSTEM`).
pub fn classify<T: RegistryTree>(tree: &T, embedded_name: Option<&str>) -> HiveKind {
    if let Some(name) = embedded_name {
        let lower = name.trim().to_ascii_lowercase();
        if lower.ends_with("ntuser.dat") {
            return HiveKind::NtUser;
        }
        if lower.ends_with("software") {
            return HiveKind::Software;
        }
        if lower.ends_with("system") {
            return HiveKind::System;
        }
        if lower.ends_with("sam")
            || lower.ends_with("security")
            || lower.ends_with("usrclass.dat")
        {
            return HiveKind::Other;
        }
    }

    let root = tree.root();
    let names: Vec<String> = tree
        .subkeys(&root)
        .iter()
        .map(|k| tree.key_name(k).to_ascii_lowercase())
        .collect();
    let has = |wanted: &str| names.iter().any(|n| n == wanted);

    if has("select") && names.iter().any(|n| n.contains("controlset")) {
        HiveKind::System
    } else if has("microsoft") && has("classes") {
        HiveKind::Software
    } else if has("software") && has("control panel") {
        HiveKind::NtUser
    } else {
        HiveKind::Other
    }
}

/// Convert a Windows FILETIME to UTC. Zero means "never set".
pub fn filetime_to_datetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let secs = (filetime / FILETIME_TICKS_PER_SEC) as i64 - FILETIME_UNIX_EPOCH_SECS;
    let nanos = ((filetime % FILETIME_TICKS_PER_SEC) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

/// Inverse of [`filetime_to_datetime`]. Times before 1601 clamp to zero.
pub fn datetime_to_filetime(when: DateTime<Utc>) -> u64 {
    let secs = when.timestamp() + FILETIME_UNIX_EPOCH_SECS;
    if secs < 0 {
        return 0;
    }
    secs as u64 * FILETIME_TICKS_PER_SEC + u64::from(when.timestamp_subsec_nanos() / 100)
}

/// Decode UTF-16LE, stopping at the first NUL.
pub(crate) fn decode_utf16le(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&c| c != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn filetime_round_trips_through_datetime() {
        let when = Utc.with_ymd_and_hms(2014, 3, 9, 17, 45, 12).unwrap();
        let ft = datetime_to_filetime(when);
        assert_eq!(filetime_to_datetime(ft), Some(when));
    }

    #[test]
    fn known_filetime_decodes() {
        // 2009-07-14 04:53:25 UTC, a common Windows 7 install-media key time.
        let ft: u64 = 128_920_208_050_000_000;
        let dt = filetime_to_datetime(ft).unwrap();
        assert_eq!(dt.format("%Y-%m-%d %H:%M:%S").to_string(), "2009-07-14 04:53:25");
    }

    #[test]
    fn zero_filetime_is_absent() {
        assert_eq!(filetime_to_datetime(0), None);
    }

    #[test]
    fn string_value_decodes() {
        let v = RegValue::string("ParentIdPrefix", "7&326659cd&0");
        assert_eq!(v.as_string().as_deref(), Some("7&326659cd&0"));
    }

    #[test]
    fn binary_value_is_not_a_string() {
        let v = RegValue::binary("x", vec![0x41, 0x00]);
        assert_eq!(v.as_string(), None);
    }

    #[test]
    fn filetime_requires_eight_bytes() {
        let mut v = RegValue::filetime("Data", Utc.with_ymd_and_hms(2013, 1, 1, 0, 0, 0).unwrap());
        assert!(v.as_filetime().is_some());
        v.data.truncate(4);
        assert_eq!(v.as_filetime(), None);
    }

    #[test]
    fn ascii_payload_strips_nuls_and_high_bytes() {
        let v = RegValue::string("\\DosDevices\\E:", "\\??\\USBSTOR#Disk");
        assert_eq!(v.ascii_payload(), "\\??\\USBSTOR#Disk");

        let sig = RegValue::binary("\\DosDevices\\C:", vec![0xAA, b'A', 0x00, 0x7F]);
        assert_eq!(sig.ascii_payload(), "A\u{7f}");
    }

    #[test]
    fn classify_uses_embedded_name_first() {
        let hive = MemoryHive::new("ROOT");
        assert_eq!(
            classify(&hive, Some("\\??\\C:\\Windows\\System32\\config\\SYSTEM")),
            HiveKind::System
        );
        assert_eq!(classify(&hive, Some("SOFTWARE")), HiveKind::Software);
        assert_eq!(
            classify(&hive, Some("\\??\\C:\\Users\\bob\\NTUSER.DAT")),
            HiveKind::NtUser
        );
        assert_eq!(classify(&hive, Some("SAM")), HiveKind::Other);
    }

    #[test]
    fn classify_falls_back_to_root_shape() {
        let mut system = MemoryHive::new("ROOT");
        system.add_path("ControlSet001");
        system.add_path("Select");
        assert_eq!(classify(&system, None), HiveKind::System);

        let mut software = MemoryHive::new("ROOT");
        software.add_path("Microsoft");
        software.add_path("Classes");
        assert_eq!(classify(&software, Some("")), HiveKind::Software);

        let mut user = MemoryHive::new("ROOT");
        user.add_path("Software");
        user.add_path("Control Panel");
        assert_eq!(classify(&user, None), HiveKind::NtUser);

        assert_eq!(classify(&MemoryHive::new("ROOT"), None), HiveKind::Other);
    }

    #[test]
    fn open_and_value_are_case_insensitive() {
        let mut hive = MemoryHive::new("ROOT");
        let key = hive.add_path("Microsoft\\Windows NT\\CurrentVersion");
        hive.set_value(key, RegValue::string("CurrentVersion", "6.1"));
        hive.set_value(key, RegValue::string("", "default"));

        let found = hive.open("microsoft\\WINDOWS NT\\currentversion").unwrap();
        assert_eq!(
            hive.value(&found, "currentversion").and_then(|v| v.as_string()).as_deref(),
            Some("6.1")
        );
        assert_eq!(
            hive.value(&found, "(default)").and_then(|v| v.as_string()).as_deref(),
            Some("default")
        );
        assert!(hive.open("Microsoft\\Missing").is_none());
    }
}
