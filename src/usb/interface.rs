use plain::Plain;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub kind: u8,
    pub number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub interface_str: u8,
}

unsafe impl Plain for InterfaceDescriptor {}

/// Interface Association Descriptor, grouping interfaces into one
/// function (common for video-class devices).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterfaceAssocDescriptor {
    pub length: u8,
    pub kind: u8,
    pub first_interface: u8,
    pub interface_count: u8,
    pub function_class: u8,
    pub function_sub_class: u8,
    pub function_protocol: u8,
    pub function_str: u8,
}

unsafe impl Plain for InterfaceAssocDescriptor {}

/// On-The-Go descriptor.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct OtgDescriptor {
    pub length: u8,
    pub kind: u8,
    pub attributes: u8,
}

unsafe impl Plain for OtgDescriptor {}

#[cfg(test)]
mod tests {
    use static_assertions::const_assert_eq;

    const_assert_eq!(core::mem::size_of::<super::InterfaceDescriptor>(), 9);
    const_assert_eq!(core::mem::size_of::<super::InterfaceAssocDescriptor>(), 8);
    const_assert_eq!(core::mem::size_of::<super::OtgDescriptor>(), 3);
}
