//! The standard Device descriptor.
//!
//! Described in USB32 section 9.6.1; field offsets in USB32 Table 9-11.

/// The 18-byte USB Device Descriptor.
///
/// "Provides information that applies globally to the device and all the
/// device's configurations" (USB32 9.6.1). A device has exactly one.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    /// bLength.
    pub length: u8,
    /// bDescriptorType. See [crate::usb::DescriptorKind].
    pub kind: u8,
    /// bcdUSB, the supported USB release in binary-coded decimal.
    /// USB 2.1 is encoded as 0x0210.
    pub usb_release: u16,
    /// bDeviceClass. 0xFF is vendor specific; 0 defers class
    /// information to the interfaces.
    pub class: u8,
    /// bDeviceSubClass, qualified by `class`.
    pub sub_class: u8,
    /// bDeviceProtocol, qualified by `class` and `sub_class`.
    pub protocol: u8,
    /// bMaxPacketSize0, the max packet size of the default control
    /// endpoint.
    pub max_packet_size_0: u8,
    /// idVendor.
    pub vendor: u16,
    /// idProduct.
    pub product: u16,
    /// bcdDevice, the device release in binary-coded decimal.
    pub release: u16,
    /// iManufacturer string index.
    pub manufacturer_str: u8,
    /// iProduct string index.
    pub product_str: u8,
    /// iSerialNumber string index.
    pub serial_str: u8,
    /// bNumConfigurations.
    pub num_configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

impl DeviceDescriptor {
    pub fn usb_major_version(&self) -> u8 {
        ((self.usb_release >> 8) & 0xFF) as u8
    }
    pub fn usb_minor_version(&self) -> u8 {
        (self.usb_release & 0xFF) as u8
    }
}

/// The Device Qualifier descriptor (USB2 9.6.2, dropped in USB3).
///
/// Sent by a high-speed capable USB2 device to describe the fields that
/// would change were it operating at the other speed.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceQualifier {
    pub length: u8,
    pub kind: u8,
    pub usb_release: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// bMaxPacketSize0 at the other speed.
    pub max_packet_size_other: u8,
    /// bNumConfigurations at the other speed.
    pub num_other_speed_configurations: u8,
    pub _rsvd: u8,
}

unsafe impl plain::Plain for DeviceQualifier {}
