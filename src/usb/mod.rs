pub use self::bos::{
    parse_bos, Bos, BosCapability, BosDescriptor, CapabilityHeader, SuperSpeedCap,
    SuperSpeedPlusCap, Usb2ExtensionCap,
};
pub use self::config::{ConfigDescriptor, OtherSpeedConfig};
pub use self::device::{DeviceDescriptor, DeviceQualifier};
pub use self::endpoint::{
    EndpointDescriptor, EndpointTy, SuperSpeedCompanionDescriptor,
    SuperSpeedPlusIsochCompanionDescriptor, ENDP_ATTR_TY_MASK,
};
pub use self::interface::{InterfaceAssocDescriptor, InterfaceDescriptor, OtgDescriptor};
pub use self::setup::{Setup, SetupReq};

pub(crate) use self::endpoint::endpoint_ty;

/// Standard descriptor type codes (USB32 Table 9-6).
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescriptorKind {
    None = 0,
    Device = 0x01,
    Configuration = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
    OtherSpeedConfiguration = 0x07,
    InterfacePower = 0x08,
    OnTheGo = 0x09,
    InterfaceAssociation = 0x0B,
    BinaryObjectStore = 0x0F,
    DeviceCapability = 0x10,
    SuperSpeedCompanion = 0x30,
    SuperSpeedPlusIsochCompanion = 0x31,
}

/// Standard feature selectors (USB32 Table 9-7).
pub const FEATURE_ENDPOINT_HALT: u16 = 0;
pub const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;
pub const FEATURE_DEVICE_TEST_MODE: u16 = 2;

/// Language id sent with string-descriptor requests (US English).
pub const LANG_ID_EN_US: u16 = 0x0409;

mod bos;
mod config;
mod device;
mod endpoint;
mod interface;
mod setup;
