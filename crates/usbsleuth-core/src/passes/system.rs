/// SYSTEM hive pass.
///
/// Five stages, always in this order:
///
/// 1. `Enum\USBSTOR` enumeration (the only place records are created).
/// 2. `Properties` timestamps under each USBSTOR instance.
/// 3. `Enum\USB` vendor/product ids.
/// 4. `MountedDevices` drive letter, volume GUID, mountpoint and disk
///    signature.
/// 5. `Control\DeviceClasses` interface timestamps.
///
/// Every `ControlSetNNN` in the hive is walked, not just the current one.
use super::{
    contains_ignore_case, control_sets, string_value, DISK_CLASS_GUID, WPD_CLASS_GUID,
};
use crate::hive::RegistryTree;
use crate::model::{
    merge_timestamp, DeviceIdentity, DeviceIdentityRegistry, DeviceTimestamps, UsbDeviceRecord,
};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

const USBSTOR_PATH: &str = "Enum\\USBSTOR";
const USB_PATH: &str = "Enum\\USB";
const DEVICE_CLASSES_PATH: &str = "Control\\DeviceClasses";
const MOUNTED_DEVICES_PATH: &str = "MountedDevices";

const DOS_DEVICES_MARKER: &str = "\\DosDevices\\";
const VOLUME_MARKER: &str = "\\Volume{";
/// `\??\` in front of every device path stored in `MountedDevices`.
const MOUNT_PAYLOAD_HEADER: usize = 4;
/// Signature (4) + partition offset (8) of an MBR disk mapping.
const DISK_SIGNATURE_PAYLOAD_LEN: usize = 12;

/// Unified device property set (`DEVPKEY_Device_*Date`).
const DEVICE_PROPERTY_SET: &str = "{83da6326-97a6-4088-9453-a1923f573b29}";

#[derive(Debug, Clone, Copy)]
#[repr(u32)]
enum DeviceProperty {
    InstallDate = 0x64,
    FirstInstallDate = 0x65,
    LastArrivalDate = 0x66,
    LastRemovalDate = 0x67,
}

impl DeviceProperty {
    const ALL: [Self; 4] = [
        Self::InstallDate,
        Self::FirstInstallDate,
        Self::LastArrivalDate,
        Self::LastRemovalDate,
    ];

    fn slot(self, timestamps: &mut DeviceTimestamps) -> &mut Option<DateTime<Utc>> {
        match self {
            Self::InstallDate => &mut timestamps.install_date,
            Self::FirstInstallDate => &mut timestamps.first_install_date,
            Self::LastArrivalDate => &mut timestamps.last_arrival_date,
            Self::LastRemovalDate => &mut timestamps.last_removal_date,
        }
    }

    /// Vista / 7: `{set}\00000064\00000000`, value `Data`.
    fn legacy_path(self) -> String {
        format!("{DEVICE_PROPERTY_SET}\\{:08x}\\00000000", self as u32)
    }

    /// 8 and later: `{set}\0064`, default value.
    fn modern_path(self) -> String {
        format!("{DEVICE_PROPERTY_SET}\\{:04x}", self as u32)
    }
}

#[derive(Debug, Clone, Copy)]
enum InterfaceClass {
    Disk,
    Wpd,
}

impl InterfaceClass {
    const ALL: [Self; 2] = [Self::Disk, Self::Wpd];

    fn guid(self) -> &'static str {
        match self {
            Self::Disk => DISK_CLASS_GUID,
            Self::Wpd => WPD_CLASS_GUID,
        }
    }

    fn slot(self, timestamps: &mut DeviceTimestamps) -> &mut Option<DateTime<Utc>> {
        match self {
            Self::Disk => &mut timestamps.disk_class_created,
            Self::Wpd => &mut timestamps.wpd_class_created,
        }
    }
}

/// Run all five stages against one SYSTEM hive.
pub fn run_system_pass<T: RegistryTree>(hive: &T, registry: &mut DeviceIdentityRegistry) {
    let sets = control_sets(hive);
    if sets.is_empty() {
        warn!("SYSTEM hive has no ControlSet keys; only MountedDevices will be read");
    }
    let before = registry.len();

    enumerate_usbstor(hive, &sets, registry);
    enrich_usbstor_properties(hive, &sets, registry);
    enrich_usb_bus(hive, &sets, registry);
    enrich_mounted_devices(hive, registry);
    enrich_device_classes(hive, &sets, registry);

    info!(
        "SYSTEM pass: {} control sets, {} new devices ({} total)",
        sets.len(),
        registry.len() - before,
        registry.len()
    );
}

// ── Stage 1: USBSTOR ─────────────────────────────────────────────────

/// One `Enum\USBSTOR\<class>\<instance>` key.
struct UsbstorInstance<K> {
    class_name: String,
    instance_name: String,
    key: K,
}

fn usbstor_instances<T: RegistryTree>(hive: &T, sets: &[T::Key]) -> Vec<UsbstorInstance<T::Key>> {
    let mut out = Vec::new();
    for set in sets {
        let Some(usbstor) = hive.open_from(set, USBSTOR_PATH) else {
            debug!("no {} under {}", USBSTOR_PATH, hive.key_name(set));
            continue;
        };
        for class_key in hive.subkeys(&usbstor) {
            let class_name = hive.key_name(&class_key);
            if !is_disk_class(&class_name) {
                debug!(class = %class_name, "USBSTOR entry is not a disk, skipped");
                continue;
            }
            for key in hive.subkeys(&class_key) {
                out.push(UsbstorInstance {
                    class_name: class_name.clone(),
                    instance_name: hive.key_name(&key),
                    key,
                });
            }
        }
    }
    out
}

pub(crate) fn enumerate_usbstor<T: RegistryTree>(
    hive: &T,
    sets: &[T::Key],
    registry: &mut DeviceIdentityRegistry,
) {
    for instance in usbstor_instances(hive, sets) {
        let (vendor, product, version) = match parse_device_type_key(&instance.class_name) {
            Some(parts) => parts,
            None => {
                warn!(
                    class = %instance.class_name,
                    "device type key does not split into 4 '&' parts; vendor/product/version left empty"
                );
                Default::default()
            }
        };
        let serial_number = serial_from_instance(&instance.instance_name).to_string();
        let parent_prefix_id = string_value(hive, &instance.key, "ParentIdPrefix")
            .or_else(|| {
                instance
                    .instance_name
                    .contains('&')
                    .then(|| instance.instance_name.clone())
            })
            .unwrap_or_default();

        let identity = DeviceIdentity {
            serial_number,
            vendor,
            product,
            version,
            parent_prefix_id,
        };
        let mut record = UsbDeviceRecord::new(identity, &instance.class_name);
        record.timestamps.usbstor_created = hive.timestamp(&instance.key);

        let serial = record.serial_number().to_string();
        if registry.add(record) {
            debug!(serial = %serial, "device record created");
        } else {
            debug!(serial = %serial, "duplicate USBSTOR sighting discarded");
        }
    }
}

// ── Stage 2: Properties ──────────────────────────────────────────────

pub(crate) fn enrich_usbstor_properties<T: RegistryTree>(
    hive: &T,
    sets: &[T::Key],
    registry: &mut DeviceIdentityRegistry,
) {
    for instance in usbstor_instances(hive, sets) {
        let (vendor, product, version) =
            parse_device_type_key(&instance.class_name).unwrap_or_default();
        let serial = serial_from_instance(&instance.instance_name);
        let Some(record) = registry.find_by_identity_mut(serial, &vendor, &product, &version)
        else {
            continue;
        };
        let Some(properties) = hive.subkey(&instance.key, "Properties") else {
            debug!(serial = %serial, "no Properties key");
            continue;
        };

        for property in DeviceProperty::ALL {
            let legacy = hive
                .open_from(&properties, &property.legacy_path())
                .and_then(|k| hive.value(&k, "Data"))
                .and_then(|v| v.as_filetime());
            merge_timestamp(property.slot(&mut record.timestamps), legacy);

            let modern = hive
                .open_from(&properties, &property.modern_path())
                .and_then(|k| hive.value(&k, ""))
                .and_then(|v| v.as_filetime());
            merge_timestamp(property.slot(&mut record.timestamps), modern);
        }
    }
}

// ── Stage 3: Enum\USB ────────────────────────────────────────────────

pub(crate) fn enrich_usb_bus<T: RegistryTree>(
    hive: &T,
    sets: &[T::Key],
    registry: &mut DeviceIdentityRegistry,
) {
    for set in sets {
        let Some(usb) = hive.open_from(set, USB_PATH) else {
            continue;
        };
        for id_key in hive.subkeys(&usb) {
            let id_name = hive.key_name(&id_key);
            let lower = id_name.to_ascii_lowercase();
            if !lower.contains("vid") && !lower.contains("pid") {
                continue;
            }
            let Some((vid, pid)) = split_vid_pid(&id_name) else {
                warn!(key = %id_name, "USB id key does not split into VID&PID");
                continue;
            };
            let created = hive.timestamp(&id_key);

            for serial_key in hive.subkeys(&id_key) {
                let serial = hive.key_name(&serial_key);
                if let Some(record) = registry.find_by_serial_mut(&serial) {
                    record.vid = Some(vid.to_string());
                    record.pid = Some(pid.to_string());
                    merge_timestamp(&mut record.timestamps.vid_pid_created, created);
                    debug!(serial = %serial, vid, pid, "USB bus ids resolved");
                }
            }
        }
    }
}

// ── Stage 4: MountedDevices ──────────────────────────────────────────

struct MountedValue {
    name: String,
    raw: Vec<u8>,
    payload: String,
    payload_lower: String,
}

impl MountedValue {
    fn is_dos_device(&self) -> bool {
        self.name.contains(DOS_DEVICES_MARKER)
    }

    fn is_volume(&self) -> bool {
        self.name.contains(VOLUME_MARKER)
    }

    fn drive_letter(&self) -> String {
        self.name.replace(DOS_DEVICES_MARKER, "")
    }

    fn mountpoint(&self) -> String {
        self.payload
            .get(MOUNT_PAYLOAD_HEADER..)
            .unwrap_or_default()
            .to_string()
    }

    fn disk_signature(&self) -> Option<String> {
        if !self.is_dos_device() || self.raw.len() != DISK_SIGNATURE_PAYLOAD_LEN {
            return None;
        }
        Some(self.raw[..4].iter().map(|b| format!("{b:02x}")).collect())
    }
}

/// `\??\Volume{0a1b...}` → `0a1b...`.
fn volume_guid(name: &str) -> Option<String> {
    let start = name.find(VOLUME_MARKER)? + VOLUME_MARKER.len();
    let rest = &name[start..];
    let end = rest.find('}')?;
    Some(rest[..end].to_string()).filter(|g| !g.is_empty())
}

pub(crate) fn enrich_mounted_devices<T: RegistryTree>(
    hive: &T,
    registry: &mut DeviceIdentityRegistry,
) {
    let Some(mounted) = hive.open(MOUNTED_DEVICES_PATH) else {
        debug!("no MountedDevices key");
        return;
    };
    let values: Vec<MountedValue> = hive
        .values(&mounted)
        .into_iter()
        .map(|v| {
            let payload = v.ascii_payload();
            MountedValue {
                name: v.name,
                raw: v.data,
                payload_lower: payload.to_ascii_lowercase(),
                payload,
            }
        })
        .collect();

    for record in registry.iter_mut() {
        resolve_mount_facts(record, &values);
    }
}

fn resolve_mount_facts(record: &mut UsbDeviceRecord, values: &[MountedValue]) {
    let ppid = record.parent_prefix_id().to_string();

    // Narrow tier: the parent id prefix appears verbatim in the payload.
    if !ppid.is_empty() {
        if let Some(v) = values
            .iter()
            .find(|v| v.is_dos_device() && v.payload.contains(&ppid))
        {
            record.drive_letter = Some(v.drive_letter());
            debug!(
                serial = %record.serial_number(),
                drive = %v.drive_letter(),
                "drive letter resolved by ParentIdPrefix"
            );
        }
        if let Some((v, guid)) = values
            .iter()
            .filter(|v| v.is_volume() && v.payload.contains(&ppid))
            .find_map(|v| volume_guid(&v.name).map(|g| (v, g)))
        {
            debug!(
                serial = %record.serial_number(),
                guid = %guid,
                "volume GUID resolved by ParentIdPrefix"
            );
            record.guid = Some(guid);
            record.mountpoint = Some(v.mountpoint());
        }
    }

    // Fallback tier: the composed USBSTOR device path, case-insensitive.
    let composed = record.composed_device_path().to_ascii_lowercase();
    if record.drive_letter.is_none() {
        if let Some(v) = values
            .iter()
            .find(|v| v.is_dos_device() && v.payload_lower.contains(&composed))
        {
            record.drive_letter = Some(v.drive_letter());
            debug!(
                serial = %record.serial_number(),
                drive = %v.drive_letter(),
                "drive letter resolved by device path"
            );
        }
    }
    if record.guid.is_none() {
        if let Some((v, guid)) = values
            .iter()
            .filter(|v| v.is_volume() && v.payload_lower.contains(&composed))
            .find_map(|v| volume_guid(&v.name).map(|g| (v, g)))
        {
            debug!(
                serial = %record.serial_number(),
                guid = %guid,
                "volume GUID resolved by device path"
            );
            record.guid = Some(guid);
            record.mountpoint = Some(v.mountpoint());
        }
    }

    // The signature for the device's own letter if it has one, otherwise
    // the last 12-byte mapping in the key.
    let own = record.drive_letter.as_deref().and_then(|letter| {
        values
            .iter()
            .filter(|v| v.drive_letter().eq_ignore_ascii_case(letter))
            .find_map(MountedValue::disk_signature)
    });
    let signature = own.or_else(|| values.iter().filter_map(MountedValue::disk_signature).last());
    if signature.is_some() {
        record.disk_signature = signature;
    }
}

// ── Stage 5: DeviceClasses ───────────────────────────────────────────

pub(crate) fn enrich_device_classes<T: RegistryTree>(
    hive: &T,
    sets: &[T::Key],
    registry: &mut DeviceIdentityRegistry,
) {
    for set in sets {
        for class in InterfaceClass::ALL {
            let path = format!("{DEVICE_CLASSES_PATH}\\{}", class.guid());
            let Some(class_key) = hive.open_from(set, &path) else {
                continue;
            };
            let interfaces: Vec<(String, Option<DateTime<Utc>>)> = hive
                .subkeys(&class_key)
                .iter()
                .map(|k| (hive.key_name(k), hive.timestamp(k)))
                .collect();

            for record in registry.iter_mut() {
                let Some(mountpoint) = record
                    .mountpoint
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                else {
                    continue;
                };
                let serial = record.serial_number();
                let hit = interfaces
                    .iter()
                    .find(|(name, _)| contains_ignore_case(name, mountpoint))
                    .or_else(|| {
                        if serial.is_empty() {
                            return None;
                        }
                        interfaces
                            .iter()
                            .find(|(name, _)| contains_ignore_case(name, serial))
                    });
                if let Some((name, created)) = hit {
                    debug!(serial = %serial, interface = %name, "device class entry matched");
                    let created = *created;
                    merge_timestamp(class.slot(&mut record.timestamps), created);
                }
            }
        }
    }
}

// ── Name parsing ─────────────────────────────────────────────────────

/// First `&` token of the class key is the device type.
fn is_disk_class(name: &str) -> bool {
    name.split('&')
        .next()
        .is_some_and(|t| t.eq_ignore_ascii_case("disk"))
}

/// `Disk&Ven_SanDisk&Prod_Cruzer&Rev_7.01` → `(SanDisk, Cruzer, 7.01)`.
pub(crate) fn parse_device_type_key(name: &str) -> Option<(String, String, String)> {
    let parts: Vec<&str> = name.split('&').collect();
    if parts.len() != 4 {
        return None;
    }
    Some((
        strip_token_prefix(parts[1], "Ven_"),
        strip_token_prefix(parts[2], "Prod_"),
        strip_token_prefix(parts[3], "Rev_"),
    ))
}

fn strip_token_prefix(token: &str, prefix: &str) -> String {
    match token.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => token[prefix.len()..].to_string(),
        _ => token.to_string(),
    }
}

/// Instance names of the form `<serial>&<n>` carry a port suffix that
/// Windows appends; anything else is taken verbatim.
pub(crate) fn serial_from_instance(name: &str) -> &str {
    let mut parts = name.split('&');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(serial), Some(_), None) => serial,
        _ => name,
    }
}

/// `VID_0781&PID_5530` → `("VID_0781", "PID_5530")`.
fn split_vid_pid(name: &str) -> Option<(&str, &str)> {
    let mut parts = name.split('&');
    let vid = parts.next().filter(|s| !s.is_empty())?;
    let pid = parts.next().filter(|s| !s.is_empty())?;
    Some((vid, pid))
}
