/// Run orchestrator: owns the device registry and drives the passes in
/// their fixed order: SYSTEM → SOFTWARE → NTUSER → install logs.
use crate::config::RunConfig;
use crate::discovery::{discover, SkippedFile};
use crate::error::CorrelateError;
use crate::hive::RegistryTree;
use crate::install_log::{decode_log_bytes, InstallLogCorrelator};
use crate::model::{DeviceIdentityRegistry, UsbDeviceRecord};
use crate::os_version::OsVersionContext;
use crate::passes::{run_software_pass, run_system_pass, run_user_pass};
use serde::Serialize;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

/// Counters for one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub system_hives: usize,
    pub software_hives: usize,
    pub user_hives: usize,
    pub log_files: usize,
    pub install_times_matched: usize,
    pub mount_history_entries: usize,
    pub os_version: String,
    pub skipped: Vec<SkippedFile>,
}

/// The consolidated device set plus what happened along the way.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub devices: Vec<UsbDeviceRecord>,
    pub summary: RunSummary,
}

/// Holds the state shared by the passes for one run.
pub struct Correlator {
    registry: DeviceIdentityRegistry,
    os: OsVersionContext,
    logs: InstallLogCorrelator,
    summary: RunSummary,
}

impl Correlator {
    pub fn new(os_version_override: Option<String>) -> Result<Self, CorrelateError> {
        Ok(Self {
            registry: DeviceIdentityRegistry::new(),
            os: OsVersionContext::with_override(os_version_override),
            logs: InstallLogCorrelator::new()?,
            summary: RunSummary::default(),
        })
    }

    pub fn process_system_hive<T: RegistryTree>(&mut self, hive: &T) {
        run_system_pass(hive, &mut self.registry);
        self.summary.system_hives += 1;
    }

    pub fn process_software_hive<T: RegistryTree>(&mut self, hive: &T) {
        run_software_pass(hive, &mut self.os, &mut self.registry);
        self.summary.software_hives += 1;
    }

    pub fn process_user_hive<T: RegistryTree>(&mut self, hive: &T, source: &Path) {
        self.summary.mount_history_entries += run_user_pass(hive, source, &mut self.registry);
        self.summary.user_hives += 1;
    }

    /// Correlate one install log given as text.
    pub fn process_log_text(&mut self, text: &str) -> usize {
        let grammar = self.os.grammar();
        let index = self.logs.index(text, grammar);
        let matched = self.logs.merge(&index, grammar, &mut self.registry);
        self.summary.install_times_matched += matched;
        self.summary.log_files += 1;
        matched
    }

    /// Read and correlate one install log. An unreadable file is recorded
    /// as skipped.
    pub fn process_log_file(&mut self, path: &Path) {
        match std::fs::read(path) {
            Ok(bytes) => {
                let matched = self.process_log_text(&decode_log_bytes(&bytes));
                info!("install log {}: {} install times matched", path.display(), matched);
            }
            Err(err) => {
                warn!(path = %path.display(), "skipping unreadable log: {err}");
                self.summary.skipped.push(SkippedFile {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                });
            }
        }
    }

    pub fn registry(&self) -> &DeviceIdentityRegistry {
        &self.registry
    }

    pub fn os_version(&self) -> &OsVersionContext {
        &self.os
    }

    pub fn finish(mut self) -> RunOutcome {
        self.summary.os_version = self.os.version().to_string();
        RunOutcome {
            devices: self.registry.into_devices(),
            summary: self.summary,
        }
    }
}

/// Discover evidence under `config.input` and run every pass over it.
pub fn run(config: &RunConfig) -> Result<RunOutcome, CorrelateError> {
    let start = Instant::now();
    let evidence = discover(config)?;
    let mut correlator = Correlator::new(config.os_version_override.clone())?;

    for loaded in &evidence.system {
        info!("processing SYSTEM hive {}", loaded.path.display());
        correlator.process_system_hive(&loaded.hive);
    }
    for loaded in &evidence.software {
        info!("processing SOFTWARE hive {}", loaded.path.display());
        correlator.process_software_hive(&loaded.hive);
    }
    for loaded in &evidence.user {
        info!("processing NTUSER hive {}", loaded.path.display());
        correlator.process_user_hive(&loaded.hive, &loaded.path);
    }
    for log in &evidence.logs {
        correlator.process_log_file(log);
    }

    let mut outcome = correlator.finish();
    let mut skipped = evidence.skipped;
    skipped.append(&mut outcome.summary.skipped);
    outcome.summary.skipped = skipped;
    info!(
        "correlation finished: {} devices in {:.2?}",
        outcome.devices.len(),
        start.elapsed()
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hive::{MemoryHive, RegValue};

    const MOUNTPOINT: &str = "USBSTOR#Disk&Ven_SanDisk&Prod_Cruzer&Rev_7.01#2444120C4E80D827&0#{53f56307-b6bf-11d0-94f2-00a0c91efb8b}";
    const GUID: &str = "6f2ab1b4-9b3c-11e2-a1a1-000c29e3a1b2";

    #[test]
    fn full_sequence_enriches_every_source() {
        let (system, software, user) = hives();
        let mut c = Correlator::new(None).unwrap();
        c.process_system_hive(&system);
        c.process_software_hive(&software);
        c.process_user_hive(&user, Path::new("NTUSER.DAT"));
        c.process_log_text(&modern_log());

        let outcome = c.finish();
        assert_eq!(outcome.devices.len(), 1);
        let d = &outcome.devices[0];
        assert_eq!(d.guid.as_deref(), Some(GUID));
        assert_eq!(d.volume_name.as_deref(), Some("CRUZER"));
        assert_eq!(d.external_media().len(), 1);
        assert_eq!(d.mount_history().len(), 1);
        assert!(d.timestamps.install_date.is_some());
        assert_eq!(outcome.summary.os_version, "6.1");
        assert_eq!(outcome.summary.install_times_matched, 1);
    }

    #[test]
    fn later_passes_before_system_pass_enrich_less() {
        let (system, software, user) = hives();

        let mut ordered = Correlator::new(None).unwrap();
        ordered.process_system_hive(&system);
        ordered.process_software_hive(&software);
        ordered.process_user_hive(&user, Path::new("NTUSER.DAT"));

        let mut reversed = Correlator::new(None).unwrap();
        reversed.process_software_hive(&software);
        reversed.process_user_hive(&user, Path::new("NTUSER.DAT"));
        reversed.process_system_hive(&system);

        let good = &ordered.registry().devices()[0];
        let poor = &reversed.registry().devices()[0];
        assert!(enriched_fields(poor) < enriched_fields(good));
        assert!(poor.external_media().is_empty());
        assert!(poor.mount_history().is_empty());
    }

    #[test]
    fn replaying_the_run_is_idempotent() {
        let (system, software, user) = hives();
        let log = modern_log();
        let mut c = Correlator::new(None).unwrap();
        for _ in 0..2 {
            c.process_system_hive(&system);
            c.process_software_hive(&software);
            c.process_user_hive(&user, Path::new("NTUSER.DAT"));
            c.process_log_text(&log);
        }
        let d = &c.registry().devices()[0];
        assert_eq!(c.registry().len(), 1);
        assert_eq!(d.external_media().len(), 1);
        assert_eq!(d.mount_history().len(), 1);
    }

    #[test]
    fn override_selects_grammar() {
        let (_, software, _) = hives();
        let mut c = Correlator::new(Some("5.1".into())).unwrap();
        c.process_software_hive(&software);
        assert_eq!(c.os_version().version(), "5.1");
    }

    #[test]
    fn unreadable_log_is_skipped() {
        let mut c = Correlator::new(None).unwrap();
        c.process_log_file(Path::new("/no/such/setupapi.dev.log"));
        let outcome = c.finish();
        assert_eq!(outcome.summary.skipped.len(), 1);
        assert_eq!(outcome.summary.log_files, 0);
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn enriched_fields(d: &UsbDeviceRecord) -> usize {
        [
            d.drive_letter.is_some(),
            d.volume_name.is_some(),
            d.guid.is_some(),
            d.mountpoint.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
            + d.external_media().len()
            + d.mount_history().len()
    }

    fn hives() -> (MemoryHive, MemoryHive, MemoryHive) {
        let mut system = MemoryHive::new("ROOT");
        let class =
            system.add_path("ControlSet001\\Enum\\USBSTOR\\Disk&Ven_SanDisk&Prod_Cruzer&Rev_7.01");
        let inst = system.add_key(class, "2444120C4E80D827&0");
        system.set_value(inst, RegValue::string("ParentIdPrefix", "2444120C4E80D827&0"));
        let md = system.add_path("MountedDevices");
        system.set_value(
            md,
            utf16(&format!("\\??\\Volume{{{GUID}}}"), &format!("_??_{MOUNTPOINT}")),
        );

        let mut software = MemoryHive::new("ROOT");
        let cv = software.add_path("Microsoft\\Windows NT\\CurrentVersion");
        software.set_value(cv, RegValue::string("CurrentVersion", "6.1"));
        let wpd = software.add_path("Microsoft\\Windows Portable Devices\\Devices");
        let dev = software.add_key(
            wpd,
            &format!("WPDBUSENUMROOT#UMB#2&37C186B&0&STORAGE#VOLUME#_??_{MOUNTPOINT}"),
        );
        software.set_value(dev, RegValue::string("FriendlyName", "CRUZER"));
        let emd = software.add_path("Microsoft\\Windows NT\\CurrentVersion\\EMDMgmt");
        software.add_key(emd, &format!("_??_{MOUNTPOINT}CRUZER_1354671104"));

        let mut user = MemoryHive::new("ROOT");
        let mp2 =
            user.add_path("Software\\Microsoft\\Windows\\CurrentVersion\\Explorer\\MountPoints2");
        user.add_key(mp2, &format!("{{{GUID}}}"));

        (system, software, user)
    }

    fn modern_log() -> String {
        format!(
            ">>>  [Device Install (Hardware initiated) - SWD\\WPDBUSENUM\\_??_{MOUNTPOINT}]\n>>>  Section start 2013/04/01 10:22:31.594\n"
        )
    }

    fn utf16(name: &str, text: &str) -> RegValue {
        RegValue::binary(name, text.encode_utf16().flat_map(u16::to_le_bytes).collect())
    }
}
