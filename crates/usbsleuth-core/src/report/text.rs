/// Plain-text report: labelled lines for each populated field.
use super::format_timestamp;
use crate::error::CorrelateError;
use crate::model::UsbDeviceRecord;
use chrono::{DateTime, Utc};
use std::io::Write;

const RULE: &str =
    "------------------------------------------------------------------------------";

pub fn write_text<W: Write>(devices: &[UsbDeviceRecord], mut out: W) -> Result<(), CorrelateError> {
    for device in devices {
        write_device(device, &mut out)?;
        writeln!(out, "{RULE}")?;
    }
    out.flush()?;
    Ok(())
}

fn write_device<W: Write>(d: &UsbDeviceRecord, out: &mut W) -> std::io::Result<()> {
    let fields: [(&str, Option<&str>); 12] = [
        ("Vendor", Some(d.vendor())),
        ("Product", Some(d.product())),
        ("Version", Some(d.version())),
        ("Serial Number", Some(d.serial_number())),
        ("VID", d.vid.as_deref()),
        ("PID", d.pid.as_deref()),
        ("Parent Prefix ID", Some(d.parent_prefix_id())),
        ("Drive Letter", d.drive_letter.as_deref()),
        ("Volume Name", d.volume_name.as_deref()),
        ("GUID", d.guid.as_deref()),
        ("Mountpoint", d.mountpoint.as_deref()),
        ("Disk Signature", d.disk_signature.as_deref()),
    ];
    for (label, value) in fields {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            writeln!(out, "{label}: {value}")?;
        }
    }

    let t = &d.timestamps;
    let times: [(&str, &Option<DateTime<Utc>>); 8] = [
        ("Device Classes Timestamp (53f56307)", &t.disk_class_created),
        ("Device Classes Timestamp (10497b1b)", &t.wpd_class_created),
        ("VID/PID Timestamp", &t.vid_pid_created),
        ("USBSTOR Timestamp", &t.usbstor_created),
        ("Install Timestamp", &t.install_date),
        ("USBSTOR First Install Date", &t.first_install_date),
        ("USBSTOR Last Arrival Date", &t.last_arrival_date),
        ("USBSTOR Last Removal Date", &t.last_removal_date),
    ];
    for (label, when) in times {
        if let Some(when) = when {
            writeln!(out, "{label}: {}", format_timestamp(when))?;
        }
    }

    for mp in d.mount_history() {
        writeln!(out, "\tMP2 File: {}", mp.source_file)?;
        if let Some(when) = &mp.timestamp {
            writeln!(out, "\tMP2 Timestamp: {}", format_timestamp(when))?;
        }
    }
    for emd in d.external_media() {
        writeln!(out, "\tEMD Volume Serial No.: {}", emd.volume_serial_number)?;
        if let Some(hex) = &emd.volume_serial_number_hex {
            writeln!(out, "\tEMD Volume Serial No. (hex): {hex}")?;
        }
        writeln!(out, "\tEMD Volume Name: {}", emd.volume_name)?;
        if let Some(when) = &emd.timestamp {
            writeln!(out, "\tEMD Timestamp: {}", format_timestamp(when))?;
        }
    }
    Ok(())
}
