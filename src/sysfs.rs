//! Device enumeration via the kernel's USB sysfs tree.
//!
//! `/sys/bus/usb/devices` carries one entry per populated bus
//! position, with the interesting descriptor fields exposed as text
//! attributes. Reading them is cheap and needs no permissions on the
//! device node itself, so enumeration never issues a control
//! transfer.

use std::fs;
use std::path::Path;

use log::{debug, trace};

use crate::device::Device;
use crate::error::{Error, Result};
use crate::usb::DeviceDescriptor;
use crate::usbfs::Speed;

pub(crate) const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

/// Walks a sysfs USB devices directory and produces one immutable
/// [`Device`] per device entry. Entries whose attributes cannot be
/// assembled (not even through the device-node fallback) are skipped,
/// not fatal.
pub(crate) fn enumerate(root: &Path) -> Result<Vec<Device>> {
    let entries = fs::read_dir(root).map_err(|err| {
        debug!("cannot read {}: {}", root.display(), err);
        Error::Io(err)
    })?;

    let mut devices = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let name = entry.file_name();
        let name = name.to_string_lossy();

        // `1-2:1.0` is an interface of device `1-2`; skip. Everything
        // else must be a device (`1-2`, `2-1.4`) or a root hub
        // (`usb1`).
        if name.contains(':') {
            continue;
        }
        if !name.contains('-') && !name.starts_with("usb") {
            continue;
        }

        match read_device(&entry.path()) {
            Ok(device) => devices.push(device),
            Err(err) => trace!("skipping {}: {}", name, err),
        }
    }
    Ok(devices)
}

fn read_device(dir: &Path) -> Result<Device> {
    // Without the bus position there is no device node to fall back
    // to, so these two stay mandatory.
    let busnum: u8 = read_parsed(dir, "busnum", 10)? as u8;
    let devnum: u8 = read_parsed(dir, "devnum", 10)? as u8;

    let descriptor = match descriptor_from_attrs(dir) {
        Ok(descriptor) => descriptor,
        Err(err) => {
            // Attribute set incomplete: read the first 18 bytes of
            // the node instead.
            trace!(
                "sysfs attributes unreadable under {} ({}), trying the node",
                dir.display(),
                err
            );
            let node = format!("/dev/bus/usb/{:03}/{:03}", busnum, devnum);
            Device::descriptor_from_node(Path::new(&node))?
        }
    };

    Ok(Device::new(
        busnum,
        devnum,
        descriptor,
        read_string(dir, "manufacturer"),
        read_string(dir, "product"),
        read_string(dir, "serial"),
        read_string(dir, "speed").and_then(|s| speed_from_sysfs(&s)),
    ))
}

fn descriptor_from_attrs(dir: &Path) -> Result<DeviceDescriptor> {
    Ok(DeviceDescriptor {
        length: 18,
        kind: 0x01,
        usb_release: read_string(dir, "version")
            .and_then(|s| parse_version(&s))
            .ok_or(Error::InvalidParameter("unreadable version"))?,
        class: read_parsed(dir, "bDeviceClass", 16)? as u8,
        sub_class: read_parsed(dir, "bDeviceSubClass", 16)? as u8,
        protocol: read_parsed(dir, "bDeviceProtocol", 16)? as u8,
        max_packet_size_0: read_parsed(dir, "bMaxPacketSize0", 10)? as u8,
        vendor: read_parsed(dir, "idVendor", 16)?,
        product: read_parsed(dir, "idProduct", 16)?,
        release: read_parsed(dir, "bcdDevice", 16)?,
        // sysfs does not expose the string indices; 1/2/3 is the
        // conventional layout, and the cached strings below are
        // preferred anyway.
        manufacturer_str: 1,
        product_str: 2,
        serial_str: 3,
        num_configurations: read_parsed(dir, "bNumConfigurations", 10)? as u8,
    })
}

fn read_string(dir: &Path, attr: &str) -> Option<String> {
    let raw = fs::read_to_string(dir.join(attr)).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn read_parsed(dir: &Path, attr: &str, radix: u32) -> Result<u16> {
    let raw = fs::read_to_string(dir.join(attr))?;
    u16::from_str_radix(raw.trim(), radix)
        .map_err(|_| Error::InvalidParameter("unparseable sysfs attribute"))
}

/// Parses the space-padded `M.mm` of the sysfs `version` file into
/// `(major << 8) | minor-in-hundredths`: `" 2.01"` is 0x0201.
pub(crate) fn parse_version(s: &str) -> Option<u16> {
    let (major, minor) = s.trim().split_once('.')?;
    let major: u16 = major.parse().ok()?;
    let minor: u16 = minor.parse().ok()?;
    Some((major << 8) | (minor & 0xFF))
}

/// Maps the sysfs `speed` attribute (megabits per second) to a speed
/// class.
fn speed_from_sysfs(s: &str) -> Option<Speed> {
    Some(match s {
        "1.5" => Speed::Low,
        "12" => Speed::Full,
        "480" => Speed::High,
        "5000" => Speed::Super,
        "10000" | "20000" => Speed::SuperPlus,
        _ => return None,
    })
}

/// True iff `path` is exactly `/dev/bus/usb/BBB/DDD` with zero-padded
/// three-digit components, bus and device address both in 1..=255.
pub fn is_valid_device_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix("/dev/bus/usb/") else {
        return false;
    };
    let mut parts = rest.split('/');
    let (Some(bus), Some(dev), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    valid_component(bus) && valid_component(dev)
}

fn valid_component(s: &str) -> bool {
    if s.len() != 3 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    matches!(s.parse::<u16>(), Ok(1..=255))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn fake_device(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir(&dir).unwrap();
        for (attr, value) in attrs {
            let mut file = File::create(dir.join(attr)).unwrap();
            writeln!(file, "{}", value).unwrap();
        }
    }

    #[test]
    fn enumerates_devices_and_skips_interfaces() {
        let root = tempfile::tempdir().unwrap();
        fake_device(
            root.path(),
            "1-4",
            &[
                ("busnum", "1"),
                ("devnum", "4"),
                ("idVendor", "046d"),
                ("idProduct", "08e5"),
                ("bcdDevice", "0011"),
                ("version", " 2.01"),
                ("bDeviceClass", "ef"),
                ("bDeviceSubClass", "02"),
                ("bDeviceProtocol", "01"),
                ("bMaxPacketSize0", "64"),
                ("bNumConfigurations", "1"),
                ("manufacturer", "Logitech"),
                ("product", "C920"),
                ("serial", "ABCDEF"),
                ("speed", "480"),
            ],
        );
        // An interface entry and an unrelated file, both skipped.
        fake_device(root.path(), "1-4:1.0", &[("bInterfaceNumber", "00")]);
        fake_device(root.path(), "ep_81", &[]);

        let devices = enumerate(root.path()).unwrap();
        assert_eq!(devices.len(), 1);
        let dev = &devices[0];
        assert_eq!(dev.bus_number(), 1);
        assert_eq!(dev.address(), 4);
        assert_eq!(dev.vendor_id(), 0x046D);
        assert_eq!(dev.product_id(), 0x08E5);
        assert_eq!({ dev.descriptor().usb_release }, 0x0201);
        assert_eq!(dev.descriptor().class, 0xEF);
        assert_eq!(dev.descriptor().max_packet_size_0, 64);
        assert_eq!(dev.manufacturer_string(), Some("Logitech"));
        assert_eq!(dev.product_string(), Some("C920"));
        assert_eq!(dev.serial_string(), Some("ABCDEF"));
        assert_eq!(dev.speed(), Some(Speed::High));
        assert_eq!(
            dev.path(),
            Path::new("/dev/bus/usb/001/004"),
        );
    }

    #[test]
    fn root_hubs_are_devices() {
        let root = tempfile::tempdir().unwrap();
        fake_device(
            root.path(),
            "usb1",
            &[
                ("busnum", "1"),
                ("devnum", "1"),
                ("idVendor", "1d6b"),
                ("idProduct", "0002"),
                ("bcdDevice", "0601"),
                ("version", " 2.00"),
                ("bDeviceClass", "09"),
                ("bDeviceSubClass", "00"),
                ("bDeviceProtocol", "01"),
                ("bMaxPacketSize0", "64"),
                ("bNumConfigurations", "1"),
            ],
        );
        let devices = enumerate(root.path()).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].vendor_id(), 0x1D6B);
        assert_eq!(devices[0].descriptor().class, 0x09);
        assert_eq!(devices[0].manufacturer_string(), None);
        assert_eq!(devices[0].speed(), None);
    }

    #[test]
    fn incomplete_entries_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        // No busnum/devnum, no node to fall back to.
        fake_device(root.path(), "2-1", &[("idVendor", "dead")]);
        let devices = enumerate(root.path()).unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_version(" 2.01"), Some(0x0201));
        assert_eq!(parse_version("2.00"), Some(0x0200));
        assert_eq!(parse_version(" 3.10"), Some(0x030A));
        assert_eq!(parse_version("1.10"), Some(0x010A));
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn device_path_validation() {
        assert!(is_valid_device_path("/dev/bus/usb/001/001"));
        assert!(is_valid_device_path("/dev/bus/usb/255/255"));
        assert!(!is_valid_device_path("/dev/bus/usb/001/256"));
        assert!(!is_valid_device_path("/dev/bus/usb/000/001"));
        assert!(!is_valid_device_path("/dev/bus/usb/001/000"));
        assert!(!is_valid_device_path("/dev/bus/usb/1/1"));
        assert!(!is_valid_device_path("/dev/bus/usb/0001/001"));
        assert!(!is_valid_device_path("/dev/bus/usb/001/001/"));
        assert!(!is_valid_device_path("/dev/bus/usb/001"));
        assert!(!is_valid_device_path("/sys/bus/usb/001/001"));
        assert!(!is_valid_device_path(""));
        assert!(!is_valid_device_path("/dev/bus/usb/00a/001"));
    }

    #[test]
    fn sysfs_speed_mapping() {
        assert_eq!(speed_from_sysfs("1.5"), Some(Speed::Low));
        assert_eq!(speed_from_sysfs("12"), Some(Speed::Full));
        assert_eq!(speed_from_sysfs("480"), Some(Speed::High));
        assert_eq!(speed_from_sysfs("5000"), Some(Speed::Super));
        assert_eq!(speed_from_sysfs("10000"), Some(Speed::SuperPlus));
        assert_eq!(speed_from_sysfs("9600"), None);
    }
}
