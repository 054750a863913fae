/// NTUSER.DAT pass: `MountPoints2` volume GUIDs the user's shell saw.
use crate::hive::RegistryTree;
use crate::model::{DeviceIdentityRegistry, MountHistoryEntry};
use std::path::Path;
use tracing::{debug, info};

const MOUNTPOINTS2_PATH: &str =
    "Software\\Microsoft\\Windows\\CurrentVersion\\Explorer\\MountPoints2";

/// Attach one history entry per device whose volume GUID has a
/// `MountPoints2\{guid}` key in this hive. Returns the number attached.
pub fn run_user_pass<T: RegistryTree>(
    hive: &T,
    source: &Path,
    registry: &mut DeviceIdentityRegistry,
) -> usize {
    let Some(mountpoints) = hive.open(MOUNTPOINTS2_PATH) else {
        debug!(path = %source.display(), "no MountPoints2 key");
        return 0;
    };
    let entries: Vec<(String, T::Key)> = hive
        .subkeys(&mountpoints)
        .into_iter()
        .map(|k| (hive.key_name(&k), k))
        .collect();

    let source_file = source.display().to_string();
    let mut attached = 0;
    for record in registry.iter_mut() {
        let Some(guid) = record.guid.as_deref().filter(|g| !g.is_empty()) else {
            continue;
        };
        let wanted = format!("{{{guid}}}");
        let Some((name, key)) = entries.iter().find(|(name, _)| *name == wanted) else {
            continue;
        };
        let entry = MountHistoryEntry {
            source_file: source_file.clone(),
            key_name: name.clone(),
            timestamp: hive.timestamp(key),
        };
        if record.push_mount_history(entry) {
            debug!(serial = %record.serial_number(), key = %name, "MountPoints2 entry attached");
            attached += 1;
        }
    }

    info!("NTUSER pass {}: {} mount history entries", source_file, attached);
    attached
}
