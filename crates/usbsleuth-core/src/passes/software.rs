/// SOFTWARE hive pass: OS version, portable-device friendly names and
/// ReadyBoost (`EMDMgmt`) volume entries.
use super::{contains_ignore_case, string_value, DISK_CLASS_GUID};
use crate::hive::RegistryTree;
use crate::model::{DeviceIdentityRegistry, ExternalMediaEntry};
use crate::os_version::OsVersionContext;
use tracing::{debug, info, warn};

const CURRENT_VERSION_PATH: &str = "Microsoft\\Windows NT\\CurrentVersion";
const PORTABLE_DEVICES_PATH: &str = "Microsoft\\Windows Portable Devices\\Devices";
const EMDMGMT_PATH: &str = "Microsoft\\Windows NT\\CurrentVersion\\EMDMgmt";

/// Device-path markers; `_##_` is how `\??\` survives in a key name.
const USBSTOR_MARKERS: [&str; 2] = ["_##_USBSTOR", "_??_USBSTOR"];
const EMD_MARKERS: [&str; 2] = ["_##_USBSTOR#Disk&", "_??_USBSTOR#Disk&"];

pub fn run_software_pass<T: RegistryTree>(
    hive: &T,
    os: &mut OsVersionContext,
    registry: &mut DeviceIdentityRegistry,
) {
    detect_os_version(hive, os);
    enrich_portable_devices(hive, registry);
    enrich_external_media(hive, registry);
    info!("SOFTWARE pass done, OS version {}", os.version());
}

pub(crate) fn detect_os_version<T: RegistryTree>(hive: &T, os: &mut OsVersionContext) {
    let version = hive
        .open(CURRENT_VERSION_PATH)
        .and_then(|k| string_value(hive, &k, "CurrentVersion"));
    match version {
        Some(v) => {
            let forced = os.is_forced();
            os.set_detected(&v);
            if forced {
                info!("SOFTWARE reports CurrentVersion {v}; keeping forced {}", os.version());
            } else {
                let releases = os.release_names();
                if releases.is_empty() {
                    info!("detected CurrentVersion {v} (unknown release)");
                } else {
                    info!(releases = %releases.join(", "), "detected CurrentVersion {v}");
                }
            }
        }
        None => debug!("no CurrentVersion value in SOFTWARE hive"),
    }
}

// ── Windows Portable Devices ─────────────────────────────────────────

/// What a `FriendlyName` value tells us.
#[derive(Debug, PartialEq, Eq)]
struct FriendlyName {
    volume_name: Option<String>,
    drive_letter: Option<String>,
}

/// `KINGSTON (E:)` → volume and letter; `E:\` → letter; else volume.
fn parse_friendly_name(value: &str) -> FriendlyName {
    if let Some(idx) = value.rfind('(') {
        let volume = value[..idx].trim();
        let drive = value[idx..].replace(['(', ')'], "");
        let drive = drive.trim();
        FriendlyName {
            volume_name: (!volume.is_empty()).then(|| volume.to_string()),
            drive_letter: (!drive.is_empty()).then(|| drive.to_string()),
        }
    } else if value.contains(":\\") {
        FriendlyName {
            volume_name: None,
            drive_letter: Some(value.trim().to_string()),
        }
    } else {
        FriendlyName {
            volume_name: Some(value.trim().to_string()),
            drive_letter: None,
        }
    }
}

pub(crate) fn enrich_portable_devices<T: RegistryTree>(
    hive: &T,
    registry: &mut DeviceIdentityRegistry,
) {
    let Some(devices) = hive.open(PORTABLE_DEVICES_PATH) else {
        debug!("no Windows Portable Devices key");
        return;
    };

    for device_key in hive.subkeys(&devices) {
        let name = hive.key_name(&device_key);
        if !USBSTOR_MARKERS.iter().any(|m| contains_ignore_case(&name, m)) {
            continue;
        }
        let Some(friendly) = string_value(hive, &device_key, "FriendlyName") else {
            debug!(key = %name, "portable device has no FriendlyName");
            continue;
        };
        let parsed = parse_friendly_name(&friendly);

        for record in registry.iter_mut() {
            let serial = record.serial_number();
            if serial.is_empty() || !contains_ignore_case(&name, serial) {
                continue;
            }
            debug!(serial = %serial, friendly = %friendly, "portable device name matched");
            if let Some(volume) = &parsed.volume_name {
                record.volume_name = Some(volume.clone());
            }
            if let Some(drive) = &parsed.drive_letter {
                record.drive_letter = Some(drive.clone());
            }
        }
    }
}

// ── EMDMgmt ──────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
struct EmdKey {
    mountpoint: String,
    volume_name: String,
    volume_serial: String,
}

/// `_??_USBSTOR#...#{53f56307-...}LABEL_1234` → mountpoint, label, serial.
fn parse_emd_key(name: &str) -> Option<EmdKey> {
    let lower = name.to_ascii_lowercase();
    let anchor = format!("#{DISK_CLASS_GUID}");
    let end = lower.find(&anchor)? + anchor.len();

    let mountpoint = name[..end].replace("_??_", "").replace("_##_", "");
    let tail = &name[end..];
    let (volume_name, volume_serial) = tail.rsplit_once('_').unwrap_or((tail, ""));
    Some(EmdKey {
        mountpoint,
        volume_name: volume_name.to_string(),
        volume_serial: volume_serial.to_string(),
    })
}

pub(crate) fn enrich_external_media<T: RegistryTree>(
    hive: &T,
    registry: &mut DeviceIdentityRegistry,
) {
    let Some(emd) = hive.open(EMDMGMT_PATH) else {
        debug!("no EMDMgmt key");
        return;
    };

    for entry_key in hive.subkeys(&emd) {
        let name = hive.key_name(&entry_key);
        if !EMD_MARKERS.iter().any(|m| contains_ignore_case(&name, m)) {
            continue;
        }
        let Some(parsed) = parse_emd_key(&name) else {
            warn!(key = %name, "EMDMgmt key has no disk class GUID");
            continue;
        };
        let timestamp = hive.timestamp(&entry_key);

        for record in registry.iter_mut() {
            let matches = record
                .mountpoint
                .as_deref()
                .is_some_and(|m| !m.is_empty() && m.eq_ignore_ascii_case(&parsed.mountpoint));
            if !matches {
                continue;
            }
            let entry =
                ExternalMediaEntry::new(&parsed.volume_name, &parsed.volume_serial, timestamp);
            if record.push_external_media(entry) {
                debug!(
                    serial = %record.serial_number(),
                    volume = %parsed.volume_name,
                    "EMDMgmt entry attached"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::{MemoryHive, RegValue};
    use crate::model::{DeviceIdentity, UsbDeviceRecord};
    use chrono::{TimeZone, Utc};

    const MOUNTPOINT: &str = "USBSTOR#Disk&Ven_Kingston&Prod_DataTraveler_2.0&Rev_PMAP#5B6B1B4E0D4E&0#{53f56307-b6bf-11d0-94f2-00a0c91efb8b}";

    #[test]
    fn detects_current_version() {
        let mut hive = MemoryHive::new("ROOT");
        let k = hive.add_path(CURRENT_VERSION_PATH);
        hive.set_value(k, RegValue::string("CurrentVersion", "6.1"));

        let mut os = OsVersionContext::new();
        run_software_pass(&hive, &mut os, &mut DeviceIdentityRegistry::new());
        assert_eq!(os.version(), "6.1");
        assert_eq!(os.release_names(), vec!["Windows 7", "Windows Server 2008 R2"]);
    }

    #[test]
    fn unknown_current_version_has_no_release_names() {
        let mut hive = MemoryHive::new("ROOT");
        let k = hive.add_path(CURRENT_VERSION_PATH);
        hive.set_value(k, RegValue::string("CurrentVersion", "10.0"));

        let mut os = OsVersionContext::new();
        detect_os_version(&hive, &mut os);
        assert_eq!(os.version(), "10.0");
        assert!(os.release_names().is_empty());
    }

    #[test]
    fn missing_current_version_stays_undefined() {
        let mut os = OsVersionContext::new();
        run_software_pass(&MemoryHive::new("ROOT"), &mut os, &mut DeviceIdentityRegistry::new());
        assert_eq!(os.version(), "undefined");
    }

    #[test]
    fn friendly_name_forms() {
        assert_eq!(
            parse_friendly_name("KINGSTON (E:)"),
            FriendlyName {
                volume_name: Some("KINGSTON".into()),
                drive_letter: Some("E:".into())
            }
        );
        assert_eq!(
            parse_friendly_name("E:\\"),
            FriendlyName {
                volume_name: None,
                drive_letter: Some("E:\\".into())
            }
        );
        assert_eq!(
            parse_friendly_name("Backup Stick"),
            FriendlyName {
                volume_name: Some("Backup Stick".into()),
                drive_letter: None
            }
        );
    }

    #[test]
    fn portable_device_sets_volume_and_letter() {
        let mut hive = MemoryHive::new("ROOT");
        let devices = hive.add_path(PORTABLE_DEVICES_PATH);
        let k = hive.add_key(
            devices,
            "WPDBUSENUMROOT#UMB#2&37C186B&0&STORAGE#VOLUME#_??_USBSTOR#DISK&VEN_KINGSTON&PROD_DATATRAVELER_2.0&REV_PMAP#5B6B1B4E0D4E&0#",
        );
        hive.set_value(k, RegValue::string("FriendlyName", "KINGSTON (F:)"));
        // No FriendlyName: skipped without touching anything.
        hive.add_key(devices, "_??_USBSTOR#DISK&VEN_OTHER#5B6B1B4E0D4E&0#");

        let mut reg = registry_with(Some(MOUNTPOINT));
        enrich_portable_devices(&hive, &mut reg);
        let d = &reg.devices()[0];
        assert_eq!(d.volume_name.as_deref(), Some("KINGSTON"));
        assert_eq!(d.drive_letter.as_deref(), Some("F:"));
    }

    #[test]
    fn emd_key_scenario() {
        let parsed = parse_emd_key(
            "_??_USBSTOR#Disk&Ven_X&Prod_Y&Rev_1#SER&0#{53f56307-b6bf-11d0-94f2-00a0c91efb8b}MyDrive_123456789",
        )
        .unwrap();
        assert_eq!(
            parsed.mountpoint,
            "USBSTOR#Disk&Ven_X&Prod_Y&Rev_1#SER&0#{53f56307-b6bf-11d0-94f2-00a0c91efb8b}",
        );
        assert_eq!(parsed.volume_name, "MyDrive");
        assert_eq!(parsed.volume_serial, "123456789");

        let bare = "_##_USBSTOR#Disk&V#S#{53F56307-B6BF-11D0-94F2-00A0C91EFB8B}_42";
        let no_label = parse_emd_key(bare).unwrap();
        assert_eq!(no_label.volume_name, "");
        assert_eq!(no_label.volume_serial, "42");

        assert_eq!(parse_emd_key("_??_USBSTOR#Disk&V#S#{other}X_1"), None);
    }

    #[test]
    fn emd_entries_attach_by_mountpoint() {
        let mut hive = MemoryHive::new("ROOT");
        let emd = hive.add_path(EMDMGMT_PATH);
        let k = hive.add_key(
            emd,
            &format!("_??_{}MyDrive_123456789", MOUNTPOINT.to_ascii_uppercase()),
        );
        let when = Utc.with_ymd_and_hms(2013, 6, 1, 8, 0, 0).unwrap();
        hive.set_timestamp(k, when);
        hive.add_key(
            emd,
            "_??_USBSTOR#Disk&Ven_Other#X#{53f56307-b6bf-11d0-94f2-00a0c91efb8b}Other_1",
        );

        let mut reg = registry_with(Some(MOUNTPOINT));
        enrich_external_media(&hive, &mut reg);
        enrich_external_media(&hive, &mut reg);

        let media = reg.devices()[0].external_media();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].volume_name, "MyDrive");
        assert_eq!(media[0].volume_serial_number, "123456789");
        assert_eq!(media[0].volume_serial_number_hex.as_deref(), Some("75bcd15"));
        assert_eq!(media[0].timestamp, Some(when));
    }

    #[test]
    fn emd_needs_a_mountpoint() {
        let mut hive = MemoryHive::new("ROOT");
        let emd = hive.add_path(EMDMGMT_PATH);
        hive.add_key(emd, &format!("_??_{MOUNTPOINT}MyDrive_1"));

        let mut reg = registry_with(None);
        enrich_external_media(&hive, &mut reg);
        assert!(reg.devices()[0].external_media().is_empty());
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn registry_with(mountpoint: Option<&str>) -> DeviceIdentityRegistry {
        let mut reg = DeviceIdentityRegistry::new();
        let mut record = UsbDeviceRecord::new(
            DeviceIdentity {
                serial_number: "5B6B1B4E0D4E".into(),
                vendor: "Kingston".into(),
                product: "DataTraveler_2.0".into(),
                version: "PMAP".into(),
                parent_prefix_id: "5B6B1B4E0D4E&0".into(),
            },
            "Disk&Ven_Kingston&Prod_DataTraveler_2.0&Rev_PMAP",
        );
        record.mountpoint = mountpoint.map(str::to_string);
        reg.add(record);
        reg
    }
}
