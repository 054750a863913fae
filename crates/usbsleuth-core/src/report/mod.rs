/// Report rendering for the consolidated device set.
///
/// - [`text`]: one labelled block per device.
/// - [`csv`]: tab-separated, every field quoted, child collections spread
///   over a variable number of columns.
/// - JSON: the records as serialised by serde.
pub mod csv;
pub mod text;

use crate::error::CorrelateError;
use crate::model::UsbDeviceRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Text,
    Csv,
    Json,
}

pub fn write_report<W: Write>(
    format: ReportFormat,
    devices: &[UsbDeviceRecord],
    out: W,
) -> Result<(), CorrelateError> {
    match format {
        ReportFormat::Text => text::write_text(devices, out),
        ReportFormat::Csv => csv::write_csv(devices, out),
        ReportFormat::Json => write_json(devices, out),
    }
}

pub fn write_json<W: Write>(
    devices: &[UsbDeviceRecord],
    mut out: W,
) -> Result<(), CorrelateError> {
    serde_json::to_writer_pretty(&mut out, devices)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

pub(crate) fn format_timestamp(when: &DateTime<Utc>) -> String {
    when.format(TIMESTAMP_FORMAT).to_string()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lists_every_device() {
        let mut buf = Vec::new();
        write_report(ReportFormat::Json, &fixtures::devices(), &mut buf).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        let list = parsed.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["serial_number"], "2444120C4E80D827");
        assert_eq!(list[0]["vendor"], "SanDisk");
        assert_eq!(list[0]["mount_history"].as_array().unwrap().len(), 2);
        assert!(list[1]["guid"].is_null());
    }

    #[test]
    fn timestamp_format_has_no_fraction() {
        use chrono::TimeZone;
        let when = Utc.with_ymd_and_hms(2013, 4, 1, 10, 22, 31).unwrap()
            + chrono::Duration::milliseconds(594);
        assert_eq!(format_timestamp(&when), "2013-04-01T10:22:31");
    }
}
