/// The hive correlation passes.
///
/// - [`system`]: creates device records from a SYSTEM hive and enriches
///   them in five fixed stages.
/// - [`software`]: OS version, portable-device names, EMDMgmt entries.
/// - [`user`]: per-user `MountPoints2` history.
///
/// Only the SYSTEM pass creates records; the others match against fields
/// it fills in, so callers must run them in that order.
pub mod software;
pub mod system;
pub mod user;

use crate::hive::RegistryTree;

pub use software::run_software_pass;
pub use system::run_system_pass;
pub use user::run_user_pass;

/// Interface class for disks; also the suffix of every USB mountpoint.
pub const DISK_CLASS_GUID: &str = "{53f56307-b6bf-11d0-94f2-00a0c91efb8b}";
/// Interface class for portable (WPD) devices.
pub const WPD_CLASS_GUID: &str = "{10497b1b-ba51-44e5-8318-a65c837b6661}";

/// Every root subkey whose name contains "ControlSet", in enumeration
/// order. `CurrentControlSet` is a link in a live hive and absent offline.
pub(crate) fn control_sets<T: RegistryTree>(hive: &T) -> Vec<T::Key> {
    hive.subkeys(&hive.root())
        .into_iter()
        .filter(|k| hive.key_name(k).contains("ControlSet"))
        .collect()
}

/// Case-insensitive substring test.
pub(crate) fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}

/// Read a value as a string, treating an empty string as absent.
pub(crate) fn string_value<T: RegistryTree>(hive: &T, key: &T::Key, name: &str) -> Option<String> {
    hive.value(key, name)
        .and_then(|v| v.as_string())
        .filter(|s| !s.is_empty())
}
