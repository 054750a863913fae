/// The set of devices discovered during a run, keyed by identity.
///
/// Records are kept in discovery order. Lookups are linear; a run sees at
/// most a few hundred devices.
use super::device::{DeviceIdentity, UsbDeviceRecord};

#[derive(Debug, Default, Clone)]
pub struct DeviceIdentityRegistry {
    devices: Vec<UsbDeviceRecord>,
}

impl DeviceIdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exists(&self, identity: &DeviceIdentity) -> bool {
        self.devices.iter().any(|d| d.identity() == identity)
    }

    /// Register a new device. Returns `false` and drops `record` when a
    /// device with the same identity is already present.
    pub fn add(&mut self, record: UsbDeviceRecord) -> bool {
        if self.exists(record.identity()) {
            return false;
        }
        self.devices.push(record);
        true
    }

    /// First device whose serial number matches exactly.
    pub fn find_by_serial(&self, serial: &str) -> Option<&UsbDeviceRecord> {
        self.devices.iter().find(|d| d.serial_number() == serial)
    }

    pub fn find_by_serial_mut(&mut self, serial: &str) -> Option<&mut UsbDeviceRecord> {
        self.devices.iter_mut().find(|d| d.serial_number() == serial)
    }

    /// Lookup on serial, vendor, product and version. The parent id prefix
    /// is not part of the key because it is exactly what callers are
    /// usually trying to learn.
    pub fn find_by_identity(
        &self,
        serial: &str,
        vendor: &str,
        product: &str,
        version: &str,
    ) -> Option<&UsbDeviceRecord> {
        self.devices.iter().find(|d| {
            d.serial_number() == serial
                && d.vendor() == vendor
                && d.product() == product
                && d.version() == version
        })
    }

    pub fn find_by_identity_mut(
        &mut self,
        serial: &str,
        vendor: &str,
        product: &str,
        version: &str,
    ) -> Option<&mut UsbDeviceRecord> {
        self.devices.iter_mut().find(|d| {
            d.serial_number() == serial
                && d.vendor() == vendor
                && d.product() == product
                && d.version() == version
        })
    }

    pub fn iter(&self) -> std::slice::Iter<'_, UsbDeviceRecord> {
        self.devices.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, UsbDeviceRecord> {
        self.devices.iter_mut()
    }

    pub fn devices(&self) -> &[UsbDeviceRecord] {
        &self.devices
    }

    pub fn into_devices(self) -> Vec<UsbDeviceRecord> {
        self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
