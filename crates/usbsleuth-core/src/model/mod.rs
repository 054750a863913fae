/// Data model for correlated USB device history.
pub mod device;
pub mod registry;

pub use device::{
    merge_timestamp, DeviceIdentity, DeviceTimestamps, ExternalMediaEntry, MountHistoryEntry,
    UsbDeviceRecord,
};
pub use registry::DeviceIdentityRegistry;
