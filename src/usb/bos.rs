//! Binary Object Store descriptors (USB32 9.6.2).
//!
//! The BOS is a container of device capability descriptors attached to
//! USB 3.0+ devices, fetched as a single GET_DESCRIPTOR block.

use log::warn;

use crate::error::{Error, Result};

/// The 5-byte BOS header.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct BosDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub cap_count: u8,
}

unsafe impl plain::Plain for BosDescriptor {}

/// Every capability item starts with this triple.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CapabilityHeader {
    pub length: u8,
    pub kind: u8,
    pub cap_ty: u8,
}

unsafe impl plain::Plain for CapabilityHeader {}

/// USB 2.0 Extension capability (cap type 0x02).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct Usb2ExtensionCap {
    pub length: u8,
    pub kind: u8,
    pub cap_ty: u8,
    pub attributes: u32,
}

unsafe impl plain::Plain for Usb2ExtensionCap {}

impl Usb2ExtensionCap {
    /// Link Power Management support bit.
    pub fn supports_lpm(&self) -> bool {
        self.attributes & (1 << 1) != 0
    }
}

/// SuperSpeed USB capability (cap type 0x03).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SuperSpeedCap {
    pub length: u8,
    pub kind: u8,
    pub cap_ty: u8,
    pub attributes: u8,
    pub speeds_supported: u16,
    pub functionality_supported: u8,
    pub u1_exit_latency: u8,
    pub u2_exit_latency: u16,
}

unsafe impl plain::Plain for SuperSpeedCap {}

/// SuperSpeedPlus capability (cap type 0x0A). Sublink speed attribute
/// dwords follow this fixed part.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SuperSpeedPlusCap {
    pub length: u8,
    pub kind: u8,
    pub cap_ty: u8,
    pub _rsvd: u8,
    pub attributes: u32,
    pub functionality_supported: u16,
    pub _rsvd1: u16,
}

impl SuperSpeedPlusCap {
    /// Number of sublink speed attributes, from the low nibble of
    /// dwAttributes.
    pub fn sublink_speed_attr_count(&self) -> u8 {
        ({ self.attributes } & 0xF) as u8 + 1
    }
}

unsafe impl plain::Plain for SuperSpeedPlusCap {}

pub const CAP_TY_USB2_EXTENSION: u8 = 0x02;
pub const CAP_TY_SUPERSPEED: u8 = 0x03;
pub const CAP_TY_SUPERSPEED_PLUS: u8 = 0x0A;

#[derive(Clone, Debug)]
pub enum BosCapability {
    Usb2Extension(Usb2ExtensionCap),
    SuperSpeed(SuperSpeedCap),
    SuperSpeedPlus(SuperSpeedPlusCap),
    /// A capability this crate does not interpret; raw bytes kept.
    Unknown(CapabilityHeader, Vec<u8>),
}

#[derive(Clone, Debug)]
pub struct Bos {
    pub descriptor: BosDescriptor,
    pub capabilities: Vec<BosCapability>,
}

impl Bos {
    pub fn superspeed(&self) -> Option<&SuperSpeedCap> {
        self.capabilities.iter().find_map(|cap| match cap {
            BosCapability::SuperSpeed(ss) => Some(ss),
            _ => None,
        })
    }
    pub fn usb2_extension(&self) -> Option<&Usb2ExtensionCap> {
        self.capabilities.iter().find_map(|cap| match cap {
            BosCapability::Usb2Extension(ext) => Some(ext),
            _ => None,
        })
    }
}

/// Parses a fetched BOS block. Truncated or inconsistent capability
/// records end the list early rather than erroring; a header that is
/// not a BOS descriptor, or a total length below the header size, is
/// an invalid BOS.
pub fn parse_bos(data: &[u8]) -> Result<Bos> {
    let descriptor: BosDescriptor = *plain::from_bytes(data)
        .map_err(|_| Error::InvalidParameter("BOS descriptor too short"))?;
    if descriptor.kind != super::DescriptorKind::BinaryObjectStore as u8 {
        return Err(Error::InvalidParameter("not a BOS descriptor"));
    }
    if { descriptor.total_length } < 5 {
        return Err(Error::InvalidParameter("invalid BOS"));
    }

    let end = usize::from({ descriptor.total_length }).min(data.len());
    let mut capabilities = Vec::with_capacity(usize::from(descriptor.cap_count));
    let mut pos = 5;

    while capabilities.len() < usize::from(descriptor.cap_count) && pos < end {
        let Some(header) = data
            .get(pos..)
            .and_then(|rest| plain::from_bytes::<CapabilityHeader>(rest).ok())
        else {
            break;
        };
        let len = usize::from(header.length);
        if len < 3 || pos + len > end {
            break;
        }
        let item = &data[pos..pos + len];

        let cap = match header.cap_ty {
            CAP_TY_USB2_EXTENSION => plain::from_bytes::<Usb2ExtensionCap>(item)
                .ok()
                .copied()
                .map(BosCapability::Usb2Extension),
            CAP_TY_SUPERSPEED => plain::from_bytes::<SuperSpeedCap>(item)
                .ok()
                .copied()
                .map(BosCapability::SuperSpeed),
            CAP_TY_SUPERSPEED_PLUS => plain::from_bytes::<SuperSpeedPlusCap>(item)
                .ok()
                .copied()
                .map(BosCapability::SuperSpeedPlus),
            ty => {
                warn!("unrecognized USB device capability type {:#x}", ty);
                Some(BosCapability::Unknown(*header, item[3..].to_vec()))
            }
        };
        // A known type with a short record is carried as unknown.
        capabilities.push(cap.unwrap_or_else(|| {
            BosCapability::Unknown(*header, item[3..].to_vec())
        }));
        pos += len;
    }

    Ok(Bos {
        descriptor,
        capabilities,
    })
}
