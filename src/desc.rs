//! Parsed configuration descriptor tree.
//!
//! A configuration descriptor fetch returns one contiguous block: the
//! 9-byte configuration header followed by interface, endpoint,
//! companion, and class-specific descriptors in wire order. This
//! module turns that block into a config → interface → alt-setting →
//! endpoint tree, keeping unrecognized descriptors as raw `extra`
//! bytes on the open alt setting, or on the configuration itself
//! when none is open.
//!
//! Malformed input never faults the parser; it truncates the tree at
//! the first inconsistency.

use log::warn;
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::usb::{
    DescriptorKind, EndpointDescriptor, EndpointTy, InterfaceAssocDescriptor,
    InterfaceDescriptor, SuperSpeedCompanionDescriptor, SuperSpeedPlusIsochCompanionDescriptor,
};

#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    /// Maximum bus power draw in 2 mA units.
    pub max_power: u8,
    pub interfaces: SmallVec<[Interface; 1]>,
    /// Descriptors appearing before the first interface descriptor,
    /// e.g. interface association descriptors.
    pub extra: Vec<u8>,
}

/// One interface, identified by its number, with all of its alternate
/// settings in ascending order. The first entry is the default
/// setting.
#[derive(Clone, Debug)]
pub struct Interface {
    pub number: u8,
    pub alt_settings: SmallVec<[AltSetting; 1]>,
}

#[derive(Clone, Debug, Default)]
pub struct AltSetting {
    pub length: u8,
    pub kind: u8,
    pub number: u8,
    pub alternate_setting: u8,
    /// bNumEndpoints as declared; may disagree with `endpoints.len()`
    /// for malformed devices.
    pub num_endpoints: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub interface_str: u8,
    pub endpoints: SmallVec<[Endpoint; 4]>,
    /// Class-specific and vendor-specific descriptors of this alt
    /// setting, in wire order.
    pub extra: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct Endpoint {
    pub length: u8,
    pub kind: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    /// Bytes of the endpoint descriptor beyond the standard seven;
    /// audio-class endpoints carry bRefresh/bSynchAddress here.
    pub tail: Vec<u8>,
    pub companion: Option<SuperSpeedCompanionDescriptor>,
    pub isoch_companion: Option<SuperSpeedPlusIsochCompanionDescriptor>,
    /// Non-standard descriptor bytes for this endpoint. The parser
    /// collects trailing class-specific records into the owning alt
    /// setting's `extra`; this stays empty unless a caller fills it
    /// in a hand-assembled tree.
    pub extra: Vec<u8>,
}

impl Endpoint {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
    pub fn is_out(&self) -> bool {
        self.address & 0x80 == 0
    }
    /// Endpoint number, without the direction bit.
    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }
    pub fn transfer_type(&self) -> EndpointTy {
        crate::usb::endpoint_ty(self.attributes)
    }
}

impl Interface {
    /// The default (first, lowest-numbered) alternate setting.
    pub fn default_setting(&self) -> &AltSetting {
        &self.alt_settings[0]
    }

    pub fn alt_setting(&self, alternate_setting: u8) -> Option<&AltSetting> {
        self.alt_settings
            .iter()
            .find(|alt| alt.alternate_setting == alternate_setting)
    }
}

impl Configuration {
    /// Parses one contiguous configuration block.
    pub fn parse(data: &[u8]) -> Result<Configuration> {
        if data.len() < 9 {
            return Err(Error::InvalidParameter("configuration descriptor too short"));
        }

        let mut config = Configuration {
            length: data[0],
            kind: data[1],
            total_length: u16::from_le_bytes([data[2], data[3]]),
            num_interfaces: data[4],
            configuration_value: data[5],
            configuration_str: data[6],
            attributes: data[7],
            max_power: data[8],
            interfaces: SmallVec::new(),
            extra: Vec::new(),
        };
        if config.kind != DescriptorKind::Configuration as u8 {
            warn!(
                "configuration block starts with descriptor type {:#x}",
                config.kind
            );
        }

        let end = usize::from(config.total_length).min(data.len());
        let mut pos = usize::from(config.length).max(9);

        // The alt setting being filled in, if any.
        let mut current: Option<AltSetting> = None;

        while pos + 2 <= end {
            let length = usize::from(data[pos]);
            let kind = data[pos + 1];
            if length < 3 || pos + length > end {
                // Zero-length or overrunning record: truncate here.
                if length != 0 {
                    warn!("truncating configuration at inconsistent record (len {length})");
                }
                break;
            }
            let record = &data[pos..pos + length];

            if kind == DescriptorKind::Interface as u8 && length >= 9 {
                if let Some(done) = current.take() {
                    config.push_alt_setting(done);
                }
                let raw: &InterfaceDescriptor = plain::from_bytes(record).unwrap();
                current = Some(AltSetting {
                    length: raw.length,
                    kind: raw.kind,
                    number: raw.number,
                    alternate_setting: raw.alternate_setting,
                    num_endpoints: raw.num_endpoints,
                    class: raw.class,
                    sub_class: raw.sub_class,
                    protocol: raw.protocol,
                    interface_str: raw.interface_str,
                    endpoints: SmallVec::new(),
                    extra: Vec::new(),
                });
            } else if kind == DescriptorKind::Endpoint as u8 && length >= 7 {
                match current {
                    None => {
                        // An endpoint with no owning interface is kept
                        // as opaque configuration bytes.
                        config.extra.extend_from_slice(record);
                    }
                    Some(ref mut alt) => {
                        let raw: &EndpointDescriptor = plain::from_bytes(record).unwrap();
                        let mut endpoint = Endpoint {
                            length: raw.length,
                            kind: raw.kind,
                            address: raw.address,
                            attributes: raw.attributes,
                            max_packet_size: raw.max_packet_size,
                            interval: raw.interval,
                            tail: record[7..].to_vec(),
                            companion: None,
                            isoch_companion: None,
                            extra: Vec::new(),
                        };
                        pos += length;
                        pos += take_companions(&data[..end], pos, &mut endpoint);
                        alt.endpoints.push(endpoint);
                        continue;
                    }
                }
            } else {
                // Class-specific, vendor-specific, IAD: raw bytes on
                // the open alt setting, else on the configuration.
                match current {
                    Some(ref mut alt) => alt.extra.extend_from_slice(record),
                    None => config.extra.extend_from_slice(record),
                }
            }

            pos += length;
        }

        if let Some(done) = current.take() {
            config.push_alt_setting(done);
        }

        Ok(config)
    }

    fn push_alt_setting(&mut self, alt: AltSetting) {
        match self
            .interfaces
            .iter_mut()
            .find(|iface| iface.number == alt.number)
        {
            Some(iface) => iface.alt_settings.push(alt),
            None => self.interfaces.push(Interface {
                number: alt.number,
                alt_settings: smallvec::smallvec![alt],
            }),
        }
    }

    pub fn interface(&self, number: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|iface| iface.number == number)
    }

    pub fn alt_setting(&self, number: u8, alternate_setting: u8) -> Option<&AltSetting> {
        self.interface(number)?.alt_setting(alternate_setting)
    }

    /// Finds an endpoint by address across every interface and alt
    /// setting.
    pub fn endpoint(&self, address: u8) -> Option<&Endpoint> {
        self.interfaces
            .iter()
            .flat_map(|iface| iface.alt_settings.iter())
            .flat_map(|alt| alt.endpoints.iter())
            .find(|ep| ep.address == address)
    }

    /// Decodes the interface association descriptors carried in this
    /// configuration's `extra` bytes.
    pub fn interface_associations(&self) -> Vec<InterfaceAssocDescriptor> {
        let mut found = Vec::new();
        let mut pos = 0;
        while pos + 2 <= self.extra.len() {
            let length = usize::from(self.extra[pos]);
            if length < 3 || pos + length > self.extra.len() {
                break;
            }
            if self.extra[pos + 1] == DescriptorKind::InterfaceAssociation as u8 && length >= 8 {
                let iad: &InterfaceAssocDescriptor =
                    plain::from_bytes(&self.extra[pos..pos + 8]).unwrap();
                found.push(*iad);
            }
            pos += length;
        }
        found
    }

    /// Serializes the tree back to wire bytes. An alt setting's
    /// `extra` is emitted between its interface descriptor and its
    /// endpoints, so the output is byte-identical to the parsed input
    /// whenever the class-specific records preceded the endpoints
    /// (the layout the standard class specs use).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(usize::from(self.total_length));
        out.extend_from_slice(&[
            self.length,
            self.kind,
            (self.total_length & 0xFF) as u8,
            (self.total_length >> 8) as u8,
            self.num_interfaces,
            self.configuration_value,
            self.configuration_str,
            self.attributes,
            self.max_power,
        ]);
        out.extend_from_slice(&self.extra);
        for iface in &self.interfaces {
            for alt in &iface.alt_settings {
                out.extend_from_slice(&[
                    alt.length,
                    alt.kind,
                    alt.number,
                    alt.alternate_setting,
                    alt.num_endpoints,
                    alt.class,
                    alt.sub_class,
                    alt.protocol,
                    alt.interface_str,
                ]);
                out.extend_from_slice(&alt.extra);
                for ep in &alt.endpoints {
                    out.extend_from_slice(&[
                        ep.length,
                        ep.kind,
                        ep.address,
                        ep.attributes,
                        (ep.max_packet_size & 0xFF) as u8,
                        (ep.max_packet_size >> 8) as u8,
                        ep.interval,
                    ]);
                    out.extend_from_slice(&ep.tail);
                    if let Some(ssc) = &ep.companion {
                        out.extend_from_slice(&[
                            ssc.length,
                            ssc.kind,
                            ssc.max_burst,
                            ssc.attributes,
                            ({ ssc.bytes_per_interval } & 0xFF) as u8,
                            ({ ssc.bytes_per_interval } >> 8) as u8,
                        ]);
                    }
                    if let Some(sspc) = &ep.isoch_companion {
                        let bpi = { sspc.bytes_per_interval };
                        out.extend_from_slice(&[
                            sspc.length,
                            sspc.kind,
                            ({ sspc._rsvd } & 0xFF) as u8,
                            ({ sspc._rsvd } >> 8) as u8,
                        ]);
                        out.extend_from_slice(&bpi.to_le_bytes());
                    }
                    out.extend_from_slice(&ep.extra);
                }
            }
        }
        out
    }
}

/// Consumes the SuperSpeed companion (and a SuperSpeed+ isochronous
/// companion after it) if they immediately follow an endpoint
/// descriptor. Returns the number of bytes taken.
fn take_companions(data: &[u8], pos: usize, endpoint: &mut Endpoint) -> usize {
    let mut taken = 0;

    if let Some(record) = peek_record(data, pos, DescriptorKind::SuperSpeedCompanion, 6) {
        endpoint.companion = Some(*plain::from_bytes(&record[..6]).unwrap());
        taken += record.len();
        if record.len() != 6 {
            warn!(
                "oversized SuperSpeed companion ({} bytes), tail dropped",
                record.len()
            );
        }

        if let Some(record) =
            peek_record(data, pos + taken, DescriptorKind::SuperSpeedPlusIsochCompanion, 8)
        {
            endpoint.isoch_companion = Some(*plain::from_bytes(&record[..8]).unwrap());
            taken += record.len();
        }
    }

    taken
}

fn peek_record(data: &[u8], pos: usize, kind: DescriptorKind, min_len: usize) -> Option<&[u8]> {
    if pos + 2 > data.len() {
        return None;
    }
    let length = usize::from(data[pos]);
    if data[pos + 1] != kind as u8 || length < min_len || pos + length > data.len() {
        return None;
    }
    Some(&data[pos..pos + length])
}

#[cfg(test)]
mod tests {
    use super::*;

    // One interface, one alt setting, two bulk endpoints.
    #[rustfmt::skip]
    const SIMPLE_CONFIG: &[u8] = &[
        0x09, 0x02, 0x20, 0x00, 0x01, 0x01, 0x00, 0xC0, 0x32,
        0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0x01, 0x00, 0x00,
        0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x0A,
        0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x0A,
    ];

    #[test]
    fn parse_simple_config() {
        let config = Configuration::parse(SIMPLE_CONFIG).unwrap();
        assert_eq!(config.configuration_value, 1);
        assert_eq!(config.num_interfaces, 1);
        assert_eq!(config.max_power, 50);
        assert_eq!(config.interfaces.len(), 1);

        let iface = &config.interfaces[0];
        assert_eq!(iface.number, 0);
        assert_eq!(iface.alt_settings.len(), 1);

        let alt = iface.default_setting();
        assert_eq!(alt.class, 0xFF);
        assert_eq!(alt.endpoints.len(), 2);
        assert_eq!(alt.endpoints[0].address, 0x81);
        assert!(alt.endpoints[0].is_in());
        assert_eq!(alt.endpoints[0].max_packet_size, 64);
        assert_eq!(alt.endpoints[0].transfer_type(), EndpointTy::Bulk);
        assert_eq!(alt.endpoints[1].address, 0x02);
        assert!(alt.endpoints[1].is_out());
    }

    #[test]
    fn roundtrip_simple_config() {
        let config = Configuration::parse(SIMPLE_CONFIG).unwrap();
        assert_eq!(config.to_bytes(), SIMPLE_CONFIG);
    }

    #[test]
    fn superspeed_companion_attaches_to_endpoint() {
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x09, 0x02, 0x1F, 0x00, 0x01, 0x01, 0x00, 0xC0, 0x32,
            0x09, 0x04, 0x00, 0x00, 0x01, 0x08, 0x06, 0x50, 0x00,
            0x07, 0x05, 0x81, 0x02, 0x00, 0x04, 0x00,
            0x06, 0x30, 0x00, 0x00, 0x00, 0x00,
        ];
        let config = Configuration::parse(data).unwrap();
        let ep = config.endpoint(0x81).unwrap();
        let ssc = ep.companion.expect("companion not attached");
        assert_eq!(ssc.max_burst, 0);
        assert_eq!(config.to_bytes(), data);
    }

    #[test]
    fn class_specific_extras_collect_on_the_alt_setting() {
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x09, 0x02, 0x2A, 0x00, 0x01, 0x01, 0x00, 0x80, 0x19,
            // IAD ahead of the first interface
            0x08, 0x0B, 0x00, 0x02, 0x0E, 0x03, 0x00, 0x00,
            0x09, 0x04, 0x00, 0x00, 0x01, 0x0E, 0x01, 0x00, 0x00,
            // class-specific header between interface and endpoint
            0x05, 0x24, 0x01, 0x00, 0x01,
            0x07, 0x05, 0x81, 0x03, 0x10, 0x00, 0x08,
            // vendor blob after the endpoint
            0x04, 0xFF, 0xAA, 0xBB,
        ];
        let config = Configuration::parse(data).unwrap();
        assert_eq!(config.extra.len(), 8);
        let iads = config.interface_associations();
        assert_eq!(iads.len(), 1);
        assert_eq!(iads[0].first_interface, 0);
        assert_eq!(iads[0].interface_count, 2);
        assert_eq!(iads[0].function_class, 0x0E);

        // Every non-standard record inside the interface block lands
        // on the alt setting's extra, in wire order, wherever it sat
        // relative to the endpoints.
        let alt = config.alt_setting(0, 0).unwrap();
        assert_eq!(
            alt.extra,
            &[0x05, 0x24, 0x01, 0x00, 0x01, 0x04, 0xFF, 0xAA, 0xBB]
        );
        assert_eq!(alt.endpoints.len(), 1);
        assert!(alt.endpoints[0].extra.is_empty());
    }

    #[test]
    fn extras_before_endpoints_roundtrip() {
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x09, 0x02, 0x26, 0x00, 0x01, 0x01, 0x00, 0x80, 0x19,
            0x08, 0x0B, 0x00, 0x02, 0x0E, 0x03, 0x00, 0x00,
            0x09, 0x04, 0x00, 0x00, 0x01, 0x0E, 0x01, 0x00, 0x00,
            0x05, 0x24, 0x01, 0x00, 0x01,
            0x07, 0x05, 0x81, 0x03, 0x10, 0x00, 0x08,
        ];
        let config = Configuration::parse(data).unwrap();
        assert_eq!(config.to_bytes(), data);
    }

    #[test]
    fn multiple_alt_settings_ordered() {
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x09, 0x02, 0x32, 0x00, 0x01, 0x01, 0x00, 0x80, 0x19,
            0x09, 0x04, 0x01, 0x00, 0x00, 0x0E, 0x02, 0x00, 0x00,
            0x09, 0x04, 0x01, 0x01, 0x01, 0x0E, 0x02, 0x00, 0x00,
            0x07, 0x05, 0x82, 0x05, 0x00, 0x04, 0x01,
            0x09, 0x04, 0x01, 0x02, 0x01, 0x0E, 0x02, 0x00, 0x00,
            0x07, 0x05, 0x82, 0x05, 0x00, 0x14, 0x01,
        ];
        let config = Configuration::parse(data).unwrap();
        assert_eq!(config.interfaces.len(), 1);
        let iface = config.interface(1).unwrap();
        assert_eq!(iface.alt_settings.len(), 3);
        let settings: Vec<u8> = iface
            .alt_settings
            .iter()
            .map(|alt| alt.alternate_setting)
            .collect();
        assert_eq!(settings, vec![0, 1, 2]);
        // Strictly increasing.
        assert!(settings.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(iface.default_setting().alternate_setting, 0);
        assert!(iface.default_setting().endpoints.is_empty());
        assert_eq!(iface.alt_setting(2).unwrap().endpoints.len(), 1);
        assert_eq!(config.to_bytes(), data);
    }

    #[test]
    fn truncates_on_overrunning_record() {
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x09, 0x02, 0x40, 0x00, 0x01, 0x01, 0x00, 0x80, 0x19,
            0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00,
            // claims 0x40 bytes, buffer ends first
            0x40, 0x05, 0x81, 0x02,
        ];
        let config = Configuration::parse(data).unwrap();
        assert_eq!(config.interfaces.len(), 1);
        assert!(config.interfaces[0].alt_settings[0].endpoints.is_empty());
    }

    #[test]
    fn truncates_on_zero_length_record() {
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x09, 0x02, 0x20, 0x00, 0x01, 0x01, 0x00, 0x80, 0x19,
            0x00, 0x00, 0x00, 0x00,
        ];
        let config = Configuration::parse(data).unwrap();
        assert!(config.interfaces.is_empty());
        assert!(config.extra.is_empty());
    }

    #[test]
    fn tolerates_endpoint_count_mismatch() {
        // Declares two endpoints, carries one.
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x09, 0x02, 0x19, 0x00, 0x01, 0x01, 0x00, 0x80, 0x19,
            0x09, 0x04, 0x00, 0x00, 0x02, 0xFF, 0x00, 0x00, 0x00,
            0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00,
        ];
        let config = Configuration::parse(data).unwrap();
        let alt = config.alt_setting(0, 0).unwrap();
        assert_eq!(alt.num_endpoints, 2);
        assert_eq!(alt.endpoints.len(), 1);
    }

    #[test]
    fn endpoint_before_interface_goes_to_config_extra() {
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x09, 0x02, 0x10, 0x00, 0x00, 0x01, 0x00, 0x80, 0x19,
            0x07, 0x05, 0x81, 0x02, 0x40, 0x00, 0x00,
        ];
        let config = Configuration::parse(data).unwrap();
        assert!(config.interfaces.is_empty());
        assert_eq!(config.extra.len(), 7);
        assert_eq!(config.to_bytes(), data);
    }

    #[test]
    fn audio_endpoint_tail_roundtrips() {
        // 9-byte audio-class endpoint descriptor carrying
        // bRefresh/bSynchAddress.
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x09, 0x02, 0x1B, 0x00, 0x01, 0x01, 0x00, 0x80, 0x19,
            0x09, 0x04, 0x00, 0x00, 0x01, 0x01, 0x02, 0x00, 0x00,
            0x09, 0x05, 0x01, 0x09, 0xC4, 0x00, 0x01, 0x00, 0x81,
        ];
        let config = Configuration::parse(data).unwrap();
        let ep = config.endpoint(0x01).unwrap();
        assert_eq!(ep.length, 9);
        assert_eq!(ep.tail, &[0x00, 0x81]);
        assert_eq!(ep.transfer_type(), EndpointTy::Isoch);
        assert_eq!(config.to_bytes(), data);
    }

    #[test]
    fn too_short_header_is_an_error() {
        assert!(Configuration::parse(&[0x09, 0x02, 0x20]).is_err());
    }

    #[test]
    fn stops_at_total_length() {
        // total_length covers only the header; trailing bytes must be
        // ignored.
        #[rustfmt::skip]
        let data: &[u8] = &[
            0x09, 0x02, 0x09, 0x00, 0x00, 0x01, 0x00, 0x80, 0x19,
            0x09, 0x04, 0x00, 0x00, 0x00, 0xFF, 0x00, 0x00, 0x00,
        ];
        let config = Configuration::parse(data).unwrap();
        assert!(config.interfaces.is_empty());
    }
}
