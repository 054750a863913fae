/// Install-log correlation: device install times from `setupapi` logs.
///
/// Each log is first reduced to an [`InstallIndex`] of install key →
/// timestamp text (first occurrence wins), then the index is merged into
/// the device records. The grammar depends on the Windows release that
/// wrote the log.
use crate::error::CorrelateError;
use crate::model::{merge_timestamp, DeviceIdentityRegistry};
use crate::os_version::LogGrammar;
use crate::passes::DISK_CLASS_GUID;
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, warn};

/// `[2009/01/29 09:40:51 1268.3 Driver Install]`
const LEGACY_HEADER: &str =
    r"(?i)^\[([0-9]+/[0-9]+/[0-9]+\s[0-9]+:[0-9]+:[0-9]+)\s[0-9]+\.[0-9]+\sDriver\sInstall\]";
/// `#I121 Device install of "USBSTOR\DISK&VEN_..\6&12202299&0" finished successfully.`
const LEGACY_KEY: &str = r#"(?i)#I121.*? "(.*)""#;
/// `>>>  [Device Install (Hardware initiated) - USBSTOR\Disk&Ven_..\SERIAL&0]`
const VISTA_DEVICE: &str = r"(?i)>>> *\[Device Install \(Hardware initiated\) - USBSTOR\\(.+)\]";
/// `>>>  [Device Install (Hardware initiated) - SWD\WPDBUSENUM\_??_USBSTOR#Disk&..#{53f56307-..}]`
const MODERN_DEVICE: &str = r"(?i)^>>>\s\s\[Device\sInstall\s\(Hardware\sinitiated\)\s-\sSWD\\WPDBUSENUM\\_\?\?_USBSTOR#(.*)\]";
/// `>>>  Section start 2013/04/01 10:22:31.594`
const SECTION_START: &str =
    r"(?i)>>>\s\sSection\sstart\s([0-9]+/[0-9]+/[0-9]+\s[0-9]+:[0-9]+:[0-9]+\.[0-9]+)";

const LOG_TIME_FORMATS: [&str; 2] = ["%Y/%m/%d %H:%M:%S%.f", "%Y/%m/%d %H:%M:%S"];

/// Install key → raw timestamp text, in first-seen order.
#[derive(Debug, Default, Clone)]
pub struct InstallIndex {
    entries: Vec<(String, String)>,
    seen: HashSet<String>,
}

impl InstallIndex {
    /// Returns `false` when the key was already present.
    pub fn insert(&mut self, key: String, timestamp: String) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.entries.push((key, timestamp));
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, t)| (k.as_str(), t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compiled log patterns.
pub struct InstallLogCorrelator {
    legacy_header: Regex,
    legacy_key: Regex,
    vista_device: Regex,
    modern_device: Regex,
    section_start: Regex,
}

impl InstallLogCorrelator {
    pub fn new() -> Result<Self, CorrelateError> {
        Ok(Self {
            legacy_header: Regex::new(LEGACY_HEADER)?,
            legacy_key: Regex::new(LEGACY_KEY)?,
            vista_device: Regex::new(VISTA_DEVICE)?,
            modern_device: Regex::new(MODERN_DEVICE)?,
            section_start: Regex::new(SECTION_START)?,
        })
    }

    pub fn index(&self, text: &str, grammar: LogGrammar) -> InstallIndex {
        match grammar {
            LogGrammar::Legacy => self.index_legacy(text),
            LogGrammar::Vista | LogGrammar::Modern => self.index_sectioned(text, grammar),
        }
    }

    /// XP `setupapi.log`. Only a line that carries both the `Driver Install`
    /// header and an `#I121` install key registers an entry; a header never
    /// dates the lines that follow it.
    fn index_legacy(&self, text: &str) -> InstallIndex {
        let mut index = InstallIndex::default();

        for line in text.lines().map(str::trim) {
            let Some(header) = self.legacy_header.captures(line) else {
                continue;
            };
            let Some(caps) = self.legacy_key.captures(line) else {
                continue;
            };
            let key = caps[1].to_string();
            if !is_usb_install_key(&key) {
                continue;
            }
            index.insert(key, header[1].to_string());
        }
        index
    }

    /// Vista and later `setupapi.dev.log`. A device-install line names the
    /// device; the line after it carries the section start time.
    fn index_sectioned(&self, text: &str, grammar: LogGrammar) -> InstallIndex {
        let mut index = InstallIndex::default();
        let mut lines = text.lines().map(str::trim);

        while let Some(line) = lines.next() {
            let key = match grammar {
                LogGrammar::Vista => self.vista_device.captures(line).map(|caps| {
                    format!("USBSTOR#{}#{DISK_CLASS_GUID}", caps[1].replace('\\', "#"))
                }),
                _ => self
                    .modern_device
                    .captures(line)
                    .map(|caps| format!("USBSTOR\\{}", &caps[1]).replace('\\', "#")),
            };
            let Some(key) = key else {
                continue;
            };

            let Some(next) = lines.next() else {
                break;
            };
            let Some(caps) = self.section_start.captures(next) else {
                debug!(key = %key, "device install line not followed by a section start");
                continue;
            };
            index.insert(key, caps[1].to_string());
        }
        index
    }

    /// Apply an index to the records. Returns the number of install dates
    /// set.
    pub fn merge(
        &self,
        index: &InstallIndex,
        grammar: LogGrammar,
        registry: &mut DeviceIdentityRegistry,
    ) -> usize {
        let mut matched = 0;
        for (key, raw_time) in index.iter() {
            let key_lower = key.to_ascii_lowercase();
            for record in registry.iter_mut() {
                let hit = match grammar {
                    LogGrammar::Legacy => {
                        let serial = record.serial_number().to_ascii_lowercase();
                        let by_ids = match (&record.vid, &record.pid) {
                            (Some(vid), Some(pid)) => key_lower.contains(&format!(
                                "{}&{}\\{}",
                                vid.to_ascii_lowercase(),
                                pid.to_ascii_lowercase(),
                                serial
                            )),
                            _ => false,
                        };
                        by_ids
                            || record.vendor_product_version_key().is_some_and(|vpv| {
                                let wanted = format!("{}\\{}", vpv.to_ascii_lowercase(), serial);
                                key_lower.contains(&wanted)
                            })
                    }
                    LogGrammar::Vista | LogGrammar::Modern => {
                        let Some(mountpoint) =
                            record.mountpoint.as_deref().filter(|m| !m.is_empty())
                        else {
                            continue;
                        };
                        let parts: Vec<&str> = mountpoint.split('#').collect();
                        if parts.len() != 4 {
                            warn!(
                                serial = %record.serial_number(),
                                mountpoint,
                                "mountpoint does not contain 4 '#' parts"
                            );
                            continue;
                        }
                        let wanted =
                            format!("{}#{}#{}#{DISK_CLASS_GUID}", parts[0], parts[1], parts[2]);
                        key_lower.contains(&wanted.to_ascii_lowercase())
                    }
                };
                if !hit {
                    continue;
                }

                match parse_log_time(raw_time) {
                    Some(when) => {
                        debug!(serial = %record.serial_number(), key, "install time matched");
                        merge_timestamp(&mut record.timestamps.install_date, Some(when));
                        matched += 1;
                    }
                    None => warn!(key, raw_time, "unparseable install log timestamp"),
                }
            }
        }
        matched
    }
}

fn is_usb_install_key(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    upper.starts_with("USB\\") || upper.starts_with("USBSTOR\\")
}

/// Log times are written in the machine's local time; they are kept as
/// written and labelled UTC.
pub fn parse_log_time(raw: &str) -> Option<DateTime<Utc>> {
    LOG_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw.trim(), fmt).ok())
        .map(|naive| naive.and_utc())
}

/// UTF-16LE when the file starts with its BOM, otherwise lossy UTF-8.
pub fn decode_log_bytes(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
