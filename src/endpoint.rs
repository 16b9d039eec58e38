use packed_struct::prelude::*;

use crate::descriptor::EndpointDescriptor;
use crate::device::Device;
use crate::request::{ControlRequest, Handler, HandlerOutcome, Predicate};
use crate::types::{
    endpoint_identifier, Direction, Recipient, SynchronizationType, TransferType, UsageType,
    ENDPOINT_IDENTIFIER_MASK,
};

/// A single endpoint within an interface's active alternate setting.
///
/// Endpoint 0 is not represented by this type: it is implicit, always a
/// control endpoint, and is handled directly by the device's dispatch
/// logic rather than being attached to an interface.
pub struct Endpoint {
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub synchronization_type: SynchronizationType,
    pub usage_type: UsageType,
    pub max_packet_size: u16,
    pub interval: u8,
    halted: bool,
    pub(crate) handlers: Vec<Handler<Device>>,
}

impl Endpoint {
    pub fn new(
        number: u8,
        direction: Direction,
        transfer_type: TransferType,
        max_packet_size: u16,
        interval: u8,
    ) -> Self {
        Self {
            number,
            direction,
            transfer_type,
            synchronization_type: SynchronizationType::NoSynchronization,
            usage_type: UsageType::Data,
            max_packet_size,
            interval,
            halted: false,
            handlers: Vec::new(),
        }
    }

    /// Registers a control request handler scoped to this endpoint: it
    /// only runs while the endpoint's owning interface alternate setting is
    /// active, and only for requests whose recipient is this endpoint
    /// (`wIndex` low byte, direction bit included, matching
    /// [`Endpoint::identifier`]) unless the predicate already overrides
    /// those fields explicitly.
    pub fn handler(
        mut self,
        mut predicate: Predicate,
        callback: impl Fn(&mut Device, &ControlRequest) -> HandlerOutcome + 'static,
    ) -> Self {
        predicate.recipient.get_or_insert(Recipient::Endpoint);
        predicate.number.get_or_insert(self.identifier() as u16);
        self.handlers.push(Handler::new(predicate, callback));
        self
    }

    /// The endpoint address/identifier byte as it appears in descriptors
    /// and in USBIP command headers: number in bits 3..0, direction in
    /// bit 7.
    pub fn identifier(&self) -> u8 {
        endpoint_identifier(self.number, self.direction)
    }

    /// Returns true if `identifier` (endpoint number + direction, with the
    /// reserved bits masked out) refers to this endpoint.
    pub fn matches_identifier(&self, identifier: u8) -> bool {
        (identifier & ENDPOINT_IDENTIFIER_MASK) == (self.identifier() & ENDPOINT_IDENTIFIER_MASK)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    fn bm_attributes(&self) -> u8 {
        let mut attrs = self.transfer_type as u8 & 0b11;
        if self.transfer_type == TransferType::Isochronous {
            attrs |= (self.synchronization_type as u8 & 0b11) << 2;
            attrs |= (self.usage_type as u8 & 0b11) << 4;
        }
        attrs
    }

    /// Encodes this endpoint's 7-byte Endpoint Descriptor.
    pub fn descriptor(&self) -> EndpointDescriptor {
        EndpointDescriptor {
            b_length: 7,
            b_descriptor_type: crate::types::DescriptorType::Endpoint as u8,
            b_endpoint_address: self.identifier(),
            bm_attributes: self.bm_attributes(),
            w_max_packet_size: Integer::from_primitive(self.max_packet_size),
            b_interval: self.interval,
        }
    }

    /// Splits `data` into `max_packet_size`-sized chunks for an IN
    /// transfer, per USB 2.0 §5.8.3: if the final chunk happens to be
    /// exactly `max_packet_size` bytes and the host requested more than
    /// `data.len()` bytes, a trailing zero-length packet is required to
    /// signal the end of the transfer.
    pub fn chunks_for_in_transfer<'a>(&self, data: &'a [u8], requested_length: usize) -> Vec<&'a [u8]> {
        chunks_for_in_transfer(data, self.max_packet_size, requested_length)
    }
}

/// Chunking logic behind [`Endpoint::chunks_for_in_transfer`], free of an
/// `Endpoint` receiver so [`crate::device::Device::send`] can apply it
/// without constructing a throwaway endpoint.
pub fn chunks_for_in_transfer<'a>(
    data: &'a [u8],
    max_packet_size: u16,
    requested_length: usize,
) -> Vec<&'a [u8]> {
    let mps = max_packet_size as usize;
    if mps == 0 {
        return vec![data];
    }
    let mut chunks: Vec<&[u8]> = data.chunks(mps).collect();
    let sent_is_full_packet = data.len() % mps == 0 && !data.is_empty();
    if sent_is_full_packet && data.len() < requested_length {
        chunks.push(&data[data.len()..]);
    }
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_matching_ignores_reserved_bits() {
        let ep = Endpoint::new(3, Direction::In, TransferType::Bulk, 512, 0);
        assert!(ep.matches_identifier(0x83));
        assert!(ep.matches_identifier(0xF3));
        assert!(!ep.matches_identifier(0x03));
    }

    #[test]
    fn zlp_is_appended_only_when_short_of_requested_length() {
        let ep = Endpoint::new(1, Direction::In, TransferType::Bulk, 8, 0);
        let data = [0u8; 8];
        let chunks = ep.chunks_for_in_transfer(&data, 16);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_empty());

        let chunks = ep.chunks_for_in_transfer(&data, 8);
        assert_eq!(chunks.len(), 1);
    }
}
