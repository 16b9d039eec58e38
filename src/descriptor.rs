#![allow(warnings)]
use packed_struct::prelude::*;

use crate::error::{Result, UsbEmuError};
use crate::types::DescriptorType;

/// The USB string descriptor length byte (bLength) is 8-bit and covers the
/// 2-byte header plus the UTF-16LE payload, so the payload itself is capped
/// at 253 bytes (2 + 253 <= 255); anything past that would wrap the length
/// byte instead of encoding a longer descriptor.
pub const MAX_STRING_PAYLOAD_BYTES: usize = 253;

/// The Device Descriptor is the root of the descriptor tree and contains
/// basic device information. idVendor/idProduct identify the device to the
/// host. 18 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "18")]
pub struct DeviceDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_usb: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_device_class: u8,
    #[packed_field(bytes = "5")]
    pub b_device_sub_class: u8,
    #[packed_field(bytes = "6")]
    pub b_device_protocol: u8,
    #[packed_field(bytes = "7")]
    pub b_max_packet_size_0: u8,
    #[packed_field(bytes = "8..=9", endian = "lsb")]
    pub id_vendor: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "10..=11", endian = "lsb")]
    pub id_product: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "12..=13", endian = "lsb")]
    pub bcd_device: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "14")]
    pub i_manufacturer: u8,
    #[packed_field(bytes = "15")]
    pub i_product: u8,
    #[packed_field(bytes = "16")]
    pub i_serial_number: u8,
    #[packed_field(bytes = "17")]
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn new(vendor_id: u16, product_id: u16, max_packet_size_0: u8) -> Self {
        Self {
            b_length: 18,
            b_descriptor_type: DescriptorType::Device as u8,
            bcd_usb: Integer::from_primitive(0x0200),
            b_device_class: 0x00,
            b_device_sub_class: 0x00,
            b_device_protocol: 0x00,
            b_max_packet_size_0: max_packet_size_0,
            id_vendor: Integer::from_primitive(vendor_id),
            id_product: Integer::from_primitive(product_id),
            bcd_device: Integer::from_primitive(0x0100),
            i_manufacturer: 0,
            i_product: 0,
            i_serial_number: 0,
            b_num_configurations: 0,
        }
    }
}

/// A high-speed-capable device that behaves differently at full-speed vs.
/// high-speed carries a Device Qualifier Descriptor describing the other
/// speed's parameters. 10 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "10")]
pub struct DeviceQualifierDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub bcd_usb: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_device_class: u8,
    #[packed_field(bytes = "5")]
    pub b_device_sub_class: u8,
    #[packed_field(bytes = "6")]
    pub b_device_protocol: u8,
    #[packed_field(bytes = "7")]
    pub b_max_packet_size_0: u8,
    #[packed_field(bytes = "8")]
    pub b_num_configurations: u8,
    #[packed_field(bytes = "9")]
    pub b_reserved: u8,
}

impl DeviceQualifierDescriptor {
    pub fn new(device: &DeviceDescriptor, num_configurations: u8) -> Self {
        Self {
            b_length: 10,
            b_descriptor_type: DescriptorType::DeviceQualifier as u8,
            bcd_usb: device.bcd_usb,
            b_device_class: device.b_device_class,
            b_device_sub_class: device.b_device_sub_class,
            b_device_protocol: device.b_device_protocol,
            b_max_packet_size_0: device.b_max_packet_size_0,
            b_num_configurations: num_configurations,
            b_reserved: 0,
        }
    }
}

/// Fixed-size header of a Configuration Descriptor. wTotalLength is filled
/// in by [`crate::configuration::Configuration::descriptor`] once the sizes
/// of the interfaces and endpoints nested beneath it are known. 9 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct ConfigurationDescriptorHeader {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2..=3", endian = "lsb")]
    pub w_total_length: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "4")]
    pub b_num_interfaces: u8,
    #[packed_field(bytes = "5")]
    pub b_configuration_value: u8,
    #[packed_field(bytes = "6")]
    pub i_configuration: u8,
    #[packed_field(bytes = "7")]
    pub bm_attributes: u8,
    #[packed_field(bytes = "8")]
    pub b_max_power: u8,
}

impl ConfigurationDescriptorHeader {
    pub fn new(
        b_configuration_value: u8,
        i_configuration: u8,
        self_powered: bool,
        remote_wakeup: bool,
        max_power_ma: u8,
    ) -> Self {
        let mut bm_attributes = 0b1000_0000u8;
        if self_powered {
            bm_attributes |= 0b0100_0000;
        }
        if remote_wakeup {
            bm_attributes |= 0b0010_0000;
        }
        Self {
            b_length: 9,
            b_descriptor_type: DescriptorType::Configuration as u8,
            w_total_length: Integer::from_primitive(9),
            b_num_interfaces: 0,
            b_configuration_value,
            i_configuration,
            bm_attributes,
            b_max_power: max_power_ma / 2,
        }
    }
}

/// 9 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "9")]
pub struct InterfaceDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_interface_number: u8,
    #[packed_field(bytes = "3")]
    pub b_alternate_setting: u8,
    #[packed_field(bytes = "4")]
    pub b_num_endpoints: u8,
    #[packed_field(bytes = "5")]
    pub b_interface_class: u8,
    #[packed_field(bytes = "6")]
    pub b_interface_subclass: u8,
    #[packed_field(bytes = "7")]
    pub b_interface_protocol: u8,
    #[packed_field(bytes = "8")]
    pub i_interface: u8,
}

/// 7 bytes.
#[derive(PackedStruct, Debug, Copy, Clone, PartialEq)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "7")]
pub struct EndpointDescriptor {
    #[packed_field(bytes = "0")]
    pub b_length: u8,
    #[packed_field(bytes = "1")]
    pub b_descriptor_type: u8,
    #[packed_field(bytes = "2")]
    pub b_endpoint_address: u8,
    #[packed_field(bytes = "3")]
    pub bm_attributes: u8,
    #[packed_field(bytes = "4..=5", endian = "lsb")]
    pub w_max_packet_size: Integer<u16, packed_bits::Bits<16>>,
    #[packed_field(bytes = "6")]
    pub b_interval: u8,
}

/// Builds a string descriptor (type 3) from a UTF-16LE-encoded string, per
/// USB 2.0 §9.6.7. The first two bytes are length and type, as with every
/// other descriptor. Fails rather than wrapping the length byte if the
/// encoded payload doesn't fit in it.
pub fn encode_string_descriptor(s: &str) -> Result<Vec<u8>> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let payload_len = units.len() * 2;
    if payload_len > MAX_STRING_PAYLOAD_BYTES {
        return Err(UsbEmuError::ConfigurationError(format!(
            "string {s:?} encodes to {payload_len} UTF-16LE bytes, exceeding the {MAX_STRING_PAYLOAD_BYTES}-byte limit a string descriptor's length byte can hold"
        )));
    }
    let mut out = Vec::with_capacity(2 + payload_len);
    out.push((2 + payload_len) as u8);
    out.push(DescriptorType::String as u8);
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(out)
}

/// Builds the LANGID string descriptor (index 0), which holds a list of
/// 16-bit language identifiers instead of a UTF-16 string.
pub fn encode_langid_descriptor(lang_ids: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + lang_ids.len() * 2);
    out.push((2 + lang_ids.len() * 2) as u8);
    out.push(DescriptorType::String as u8);
    for id in lang_ids {
        out.extend_from_slice(&id.to_le_bytes());
    }
    out
}

/// Reference to a string, either already resolved to an index or still a
/// literal to be interned. Mirrors the overloaded `get_index` argument in
/// the Python original: an int passes through, `None` means "no string",
/// and a literal is looked up or allocated.
#[derive(Debug, Clone, PartialEq)]
pub enum StringRef {
    Index(u8),
    Literal(String),
    None,
}

impl From<&str> for StringRef {
    fn from(value: &str) -> Self {
        StringRef::Literal(value.to_string())
    }
}

impl From<String> for StringRef {
    fn from(value: String) -> Self {
        StringRef::Literal(value)
    }
}

/// Collects the string descriptors referenced by a device, assigning and
/// reusing indices the same way a real Facedancer device does: the same
/// Rust `String` always maps to the same index, and overwriting an index
/// evicts its old string from the reverse map.
#[derive(Debug, Default, Clone)]
pub struct StringTable {
    next_index: u8,
    strings: std::collections::BTreeMap<u8, String>,
    indexes: std::collections::HashMap<String, u8>,
}

impl StringTable {
    pub fn new() -> Self {
        Self {
            next_index: 1,
            strings: Default::default(),
            indexes: Default::default(),
        }
    }

    /// Adds `string` at `index`, or at the next free index if `index` is
    /// `None`. Returns the index used.
    pub fn add_string(&mut self, string: &str, index: Option<u8>) -> u8 {
        let index = index.unwrap_or(self.next_index);

        if let Some(old) = self.strings.get(&index) {
            self.indexes.remove(old);
        }

        self.strings.insert(index, string.to_string());
        self.indexes.insert(string.to_string(), index);

        while self.strings.contains_key(&self.next_index) {
            self.next_index += 1;
        }

        index
    }

    /// Resolves a [`StringRef`] to a numeric index, interning literals as
    /// needed.
    pub fn index_of(&mut self, reference: &StringRef) -> u8 {
        match reference {
            StringRef::Index(i) => *i,
            StringRef::None => 0,
            StringRef::Literal(s) => {
                if let Some(i) = self.indexes.get(s) {
                    *i
                } else {
                    self.add_string(s, None)
                }
            }
        }
    }

    pub fn get(&self, index: u8) -> Option<&str> {
        self.strings.get(&index).map(|s| s.as_str())
    }

    /// Encodes the descriptor for `index`. `Ok(None)` if no string is
    /// registered there (index 0, the LANGID table, is handled separately
    /// by the device); `Err` if the string is too long for its length byte.
    pub fn descriptor(&self, index: u8) -> Result<Option<Vec<u8>>> {
        match self.get(index) {
            Some(s) => encode_string_descriptor(s).map(Some),
            None => Ok(None),
        }
    }

    /// Checks every registered string against the string descriptor length
    /// limit, so a composition mistake is caught once at connect time
    /// instead of surfacing the first time a host happens to request the
    /// offending index.
    pub fn validate(&self) -> Result<()> {
        for s in self.strings.values() {
            let payload_len = s.encode_utf16().count() * 2;
            if payload_len > MAX_STRING_PAYLOAD_BYTES {
                return Err(UsbEmuError::ConfigurationError(format!(
                    "string {s:?} encodes to {payload_len} UTF-16LE bytes, exceeding the {MAX_STRING_PAYLOAD_BYTES}-byte limit a string descriptor's length byte can hold"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_table_validate_rejects_overlong_string() {
        let mut table = StringTable::new();
        table.add_string(&"x".repeat(100), None);
        assert!(table.validate().is_ok());
        table.add_string(&"x".repeat(200), Some(2));
        assert!(table.validate().is_err());
    }

    #[test]
    fn string_table_reuses_index_for_same_literal() {
        let mut table = StringTable::new();
        let a = table.index_of(&StringRef::from("widget"));
        let b = table.index_of(&StringRef::from("widget"));
        assert_eq!(a, b);
    }

    #[test]
    fn string_table_overwrite_evicts_old_reverse_mapping() {
        let mut table = StringTable::new();
        let idx = table.add_string("first", Some(5));
        assert_eq!(idx, 5);
        table.add_string("second", Some(5));
        assert_eq!(table.get(5), Some("second"));
        assert_eq!(table.index_of(&StringRef::from("first")), 6);
    }

    #[test]
    fn device_descriptor_round_trips_through_packing() {
        let desc = DeviceDescriptor::new(0x1209, 0xabcd, 64);
        let packed = desc.pack().unwrap();
        assert_eq!(packed.len(), 18);
        assert_eq!(packed[0], 18);
        assert_eq!(u16::from_le_bytes([packed[8], packed[9]]), 0x1209);
    }
}
