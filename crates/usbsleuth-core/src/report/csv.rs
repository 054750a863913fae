/// Tab-separated export, every field quoted.
///
/// Mount-history and external-media entries are spread over numbered
/// column groups. The number of groups is the maximum across all devices,
/// and shorter rows are padded with empty cells, so every row has the same
/// width as the header.
use super::format_timestamp;
use crate::error::CorrelateError;
use crate::model::UsbDeviceRecord;
use chrono::{DateTime, Utc};
use csv::{QuoteStyle, WriterBuilder};
use std::io::Write;

const FIXED_HEADERS: [&str; 20] = [
    "Vendor",
    "Product",
    "Version",
    "SerialNumber",
    "VID",
    "PID",
    "ParentIDPrefix",
    "DriveLetter",
    "VolumeName",
    "GUID",
    "DiskSignature",
    "MountPoint",
    "Install",
    "USBSTOR",
    "USBSTOR Properties (First Install Date)",
    "USBSTOR Properties (Last Arrival Date)",
    "USBSTOR Properties (Last Removal Date)",
    "DeviceClasses (53f56307-b6bf-11d0-94f2-00a0c91efb8b)",
    "DeviceClasses (10497b1b-ba51-44e5-8318-a65c837b6661)",
    "Enum\\USB VIDPID",
];

const MOUNT_GROUP: usize = 2;
const MEDIA_GROUP: usize = 4;

pub fn write_csv<W: Write>(devices: &[UsbDeviceRecord], out: W) -> Result<(), CorrelateError> {
    let max_mounts = devices.iter().map(|d| d.mount_history().len()).max().unwrap_or(0);
    let max_media = devices.iter().map(|d| d.external_media().len()).max().unwrap_or(0);

    let mut writer = WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(QuoteStyle::Always)
        .from_writer(out);

    writer.write_record(header(max_mounts, max_media))?;
    for device in devices {
        writer.write_record(row(device, max_mounts, max_media))?;
    }
    writer.flush()?;
    Ok(())
}

fn header(max_mounts: usize, max_media: usize) -> Vec<String> {
    let mut cols: Vec<String> = FIXED_HEADERS.iter().map(|h| h.to_string()).collect();
    for i in 0..max_mounts {
        cols.push(format!("MountPoints2:{i}"));
        cols.push(format!("MountPoints2 File:{i}"));
    }
    for i in 0..max_media {
        cols.push(format!("EMDMgmt:{i}"));
        cols.push(format!("EMDMgmt Volume Serial No:{i}"));
        cols.push(format!("EMDMgmt Volume Serial No (Hex):{i}"));
        cols.push(format!("EMDMgmt Volume Name:{i}"));
    }
    cols
}

fn row(d: &UsbDeviceRecord, max_mounts: usize, max_media: usize) -> Vec<String> {
    let opt = |v: &Option<String>| v.clone().unwrap_or_default();
    let t = &d.timestamps;

    let mut cells = vec![
        d.vendor().to_string(),
        d.product().to_string(),
        d.version().to_string(),
        d.serial_number().to_string(),
        opt(&d.vid),
        opt(&d.pid),
        d.parent_prefix_id().to_string(),
        opt(&d.drive_letter),
        opt(&d.volume_name),
        opt(&d.guid),
        opt(&d.disk_signature),
        opt(&d.mountpoint),
        time_cell(&t.install_date),
        time_cell(&t.usbstor_created),
        time_cell(&t.first_install_date),
        time_cell(&t.last_arrival_date),
        time_cell(&t.last_removal_date),
        time_cell(&t.disk_class_created),
        time_cell(&t.wpd_class_created),
        time_cell(&t.vid_pid_created),
    ];

    for mp in d.mount_history() {
        cells.push(time_cell(&mp.timestamp));
        cells.push(mp.source_file.clone());
    }
    pad(&mut cells, (max_mounts - d.mount_history().len()) * MOUNT_GROUP);

    for emd in d.external_media() {
        cells.push(time_cell(&emd.timestamp));
        cells.push(emd.volume_serial_number.clone());
        cells.push(opt(&emd.volume_serial_number_hex));
        cells.push(emd.volume_name.clone());
    }
    pad(&mut cells, (max_media - d.external_media().len()) * MEDIA_GROUP);

    cells
}

fn time_cell(when: &Option<DateTime<Utc>>) -> String {
    when.as_ref().map(format_timestamp).unwrap_or_default()
}

fn pad(cells: &mut Vec<String>, n: usize) {
    cells.extend(std::iter::repeat(String::new()).take(n));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::fixtures;
    use chrono::TimeZone;

    fn parse(buf: &[u8]) -> Vec<Vec<String>> {
        ::csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .from_reader(buf)
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[test]
    fn rows_padded_to_header_width() {
        let mut buf = Vec::new();
        write_csv(&fixtures::devices(), &mut buf).unwrap();
        let rows = parse(&buf);

        assert_eq!(rows.len(), 3);
        let width = FIXED_HEADERS.len() + 2 * MOUNT_GROUP + 2 * MEDIA_GROUP;
        assert!(rows.iter().all(|r| r.len() == width));
        assert_eq!(rows[0][width - 1], "EMDMgmt Volume Name:1");
        assert_eq!(rows[1][3], "2444120C4E80D827");
        assert_eq!(rows[1][13], "2013-04-01T10:22:31");
        assert_eq!(rows[2][0], "");
    }

    #[test]
    fn install_date_has_a_single_column() {
        let mut devices = fixtures::devices();
        let installed = Utc.with_ymd_and_hms(2013, 3, 30, 8, 0, 0).unwrap();
        devices[0].timestamps.install_date = Some(installed);

        let mut buf = Vec::new();
        write_csv(&devices, &mut buf).unwrap();
        let rows = parse(&buf);

        assert_eq!(rows[0][12], "Install");
        assert!(!rows[0].iter().any(|h| h == "USBSTOR Properties (Install Date)"));
        let dated = rows[1]
            .iter()
            .filter(|cell| cell.as_str() == "2013-03-30T08:00:00")
            .count();
        assert_eq!(dated, 1);
    }

    #[test]
    fn every_field_quoted_and_tab_separated() {
        let mut buf = Vec::new();
        write_csv(&fixtures::devices()[..1], &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("\"Vendor\"\t\"Product\"\t"));
        assert!(text.contains("\"75bcd15\""));
        assert!(text.contains("\"\"\t"));
    }

    #[test]
    fn empty_device_set_writes_fixed_header_only() {
        let mut buf = Vec::new();
        write_csv(&[], &mut buf).unwrap();
        let rows = parse(&buf);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), FIXED_HEADERS.len());
    }
}
