/// A single USB mass-storage device as reconstructed from the evidence.
///
/// The identity tuple is fixed at creation time and only readable
/// afterwards; every other field is open for enrichment by later passes.
use chrono::{DateTime, Utc};
use serde::Serialize;

/// The five strings that make a device unique within a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceIdentity {
    pub serial_number: String,
    pub vendor: String,
    pub product: String,
    pub version: String,
    pub parent_prefix_id: String,
}

/// Event times gathered from keys and values across the hives and logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceTimestamps {
    /// Last write of the device's `Enum\USBSTOR` instance key.
    pub usbstor_created: Option<DateTime<Utc>>,
    /// Last write of the `Enum\USB\VID_xxxx&PID_xxxx` key.
    pub vid_pid_created: Option<DateTime<Utc>>,
    /// `DeviceClasses\{53f56307-b6bf-11d0-94f2-00a0c91efb8b}` (disk interface).
    pub disk_class_created: Option<DateTime<Utc>>,
    /// `DeviceClasses\{10497b1b-ba51-44e5-8318-a65c837b6661}` (portable device).
    pub wpd_class_created: Option<DateTime<Utc>>,
    pub install_date: Option<DateTime<Utc>>,
    pub first_install_date: Option<DateTime<Utc>>,
    pub last_arrival_date: Option<DateTime<Utc>>,
    pub last_removal_date: Option<DateTime<Utc>>,
}

/// Overwrite `slot` only when the new source actually supplied a time.
pub fn merge_timestamp(slot: &mut Option<DateTime<Utc>>, value: Option<DateTime<Utc>>) {
    if value.is_some() {
        *slot = value;
    }
}

/// A `MountPoints2` subkey attributed to the device through its volume GUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MountHistoryEntry {
    /// Path of the NTUSER.DAT hive the key was found in.
    pub source_file: String,
    pub key_name: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// An `EMDMgmt` (ReadyBoost) entry attributed to the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalMediaEntry {
    pub volume_name: String,
    pub volume_serial_number: String,
    /// Decimal serial rendered as lowercase hex without a prefix. Absent
    /// when the decimal string is empty or not a number.
    pub volume_serial_number_hex: Option<String>,
    /// Last write of the `EMDMgmt` subkey.
    pub timestamp: Option<DateTime<Utc>>,
}

impl ExternalMediaEntry {
    pub fn new(
        volume_name: &str,
        volume_serial_number: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        let volume_serial_number_hex = volume_serial_number
            .trim()
            .parse::<u64>()
            .ok()
            .map(|n| format!("{n:x}"));
        Self {
            volume_name: volume_name.to_string(),
            volume_serial_number: volume_serial_number.to_string(),
            volume_serial_number_hex,
            timestamp,
        }
    }
}

/// The correlated record for one device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsbDeviceRecord {
    #[serde(flatten)]
    identity: DeviceIdentity,
    /// The `Enum\USBSTOR` child name the device sat under, e.g.
    /// `Disk&Ven_SanDisk&Prod_Cruzer&Rev_7.01`.
    device_type_key: String,

    pub vid: Option<String>,
    pub pid: Option<String>,
    pub drive_letter: Option<String>,
    pub volume_name: Option<String>,
    pub guid: Option<String>,
    pub disk_signature: Option<String>,
    pub mountpoint: Option<String>,
    pub timestamps: DeviceTimestamps,

    mount_history: Vec<MountHistoryEntry>,
    external_media: Vec<ExternalMediaEntry>,
}

impl UsbDeviceRecord {
    pub fn new(identity: DeviceIdentity, device_type_key: &str) -> Self {
        Self {
            identity,
            device_type_key: device_type_key.to_string(),
            vid: None,
            pid: None,
            drive_letter: None,
            volume_name: None,
            guid: None,
            disk_signature: None,
            mountpoint: None,
            timestamps: DeviceTimestamps::default(),
            mount_history: Vec::new(),
            external_media: Vec::new(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn serial_number(&self) -> &str {
        &self.identity.serial_number
    }

    pub fn vendor(&self) -> &str {
        &self.identity.vendor
    }

    pub fn product(&self) -> &str {
        &self.identity.product
    }

    pub fn version(&self) -> &str {
        &self.identity.version
    }

    pub fn parent_prefix_id(&self) -> &str {
        &self.identity.parent_prefix_id
    }

    pub fn device_type_key(&self) -> &str {
        &self.device_type_key
    }

    pub fn mount_history(&self) -> &[MountHistoryEntry] {
        &self.mount_history
    }

    pub fn external_media(&self) -> &[ExternalMediaEntry] {
        &self.external_media
    }

    /// Append a mount-history entry. Returns `false` for an exact duplicate,
    /// so reprocessing the same hive leaves the record unchanged.
    pub fn push_mount_history(&mut self, entry: MountHistoryEntry) -> bool {
        if self.mount_history.contains(&entry) {
            return false;
        }
        self.mount_history.push(entry);
        true
    }

    pub fn push_external_media(&mut self, entry: ExternalMediaEntry) -> bool {
        if self.external_media.contains(&entry) {
            return false;
        }
        self.external_media.push(entry);
        true
    }

    /// `Ven_x&Prod_y&Rev_z`, the device-type key without its class token.
    pub fn vendor_product_version_key(&self) -> Option<&str> {
        self.device_type_key
            .split_once('&')
            .map(|(_, rest)| rest)
            .filter(|rest| !rest.is_empty())
    }

    /// `USBSTOR#Disk&Ven_x&Prod_y&Rev_z#serial`, the form Windows embeds
    /// in `MountedDevices` payloads for the device.
    pub fn composed_device_path(&self) -> String {
        format!(
            "USBSTOR#{}#{}",
            self.device_type_key, self.identity.serial_number
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> UsbDeviceRecord {
        UsbDeviceRecord::new(
            DeviceIdentity {
                serial_number: "4C530001230101116474".into(),
                vendor: "SanDisk".into(),
                product: "Cruzer".into(),
                version: "7.01".into(),
                parent_prefix_id: "7&2a2f3c1&0".into(),
            },
            "Disk&Ven_SanDisk&Prod_Cruzer&Rev_7.01",
        )
    }

    #[test]
    fn hex_serial_is_lowercase_without_prefix() {
        let entry = ExternalMediaEntry::new("KINGSTON", "123456789", None);
        assert_eq!(entry.volume_serial_number_hex.as_deref(), Some("75bcd15"));
    }

    #[test]
    fn non_numeric_serial_has_no_hex() {
        assert_eq!(
            ExternalMediaEntry::new("KINGSTON", "not-a-number", None).volume_serial_number_hex,
            None
        );
        assert_eq!(ExternalMediaEntry::new("KINGSTON", "", None).volume_serial_number_hex, None);
    }

    #[test]
    fn duplicate_children_are_ignored() {
        let mut r = record();
        let entry = MountHistoryEntry {
            source_file: "NTUSER.DAT".into(),
            key_name: "{guid}".into(),
            timestamp: None,
        };
        assert!(r.push_mount_history(entry.clone()));
        assert!(!r.push_mount_history(entry));
        assert_eq!(r.mount_history().len(), 1);

        assert!(r.push_external_media(ExternalMediaEntry::new("A", "1", None)));
        assert!(!r.push_external_media(ExternalMediaEntry::new("A", "1", None)));
        assert!(r.push_external_media(ExternalMediaEntry::new("B", "1", None)));
        assert_eq!(r.external_media().len(), 2);
    }

    #[test]
    fn merge_never_clears_a_timestamp() {
        let when = Utc.with_ymd_and_hms(2012, 1, 1, 0, 0, 0).unwrap();
        let mut slot = Some(when);
        merge_timestamp(&mut slot, None);
        assert_eq!(slot, Some(when));

        let later = Utc.with_ymd_and_hms(2013, 1, 1, 0, 0, 0).unwrap();
        merge_timestamp(&mut slot, Some(later));
        assert_eq!(slot, Some(later));
    }

    #[test]
    fn composed_forms() {
        let r = record();
        assert_eq!(
            r.composed_device_path(),
            "USBSTOR#Disk&Ven_SanDisk&Prod_Cruzer&Rev_7.01#4C530001230101116474"
        );
        assert_eq!(
            r.vendor_product_version_key(),
            Some("Ven_SanDisk&Prod_Cruzer&Rev_7.01")
        );
    }
}
