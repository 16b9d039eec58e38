use crate::types::{
    Direction, Recipient, RequestKind, ENDPOINT_IDENTIFIER_MASK, REQUEST_TYPE_DIRECTION_MASK,
    REQUEST_TYPE_KIND_MASK, REQUEST_TYPE_RECIPIENT_MASK,
};

/// The SETUP stage of a control transfer, decoded from the raw 8-byte
/// packet (bmRequestType, bRequest, wValue, wIndex, wLength).
#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub direction: Direction,
    pub kind: RequestKind,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
    /// Data received during the OUT data stage, if any. `None` for IN
    /// requests and OUT requests with `length == 0`.
    pub data: Option<Vec<u8>>,
}

impl ControlRequest {
    pub fn from_setup_packet(packet: &[u8; 8]) -> Option<Self> {
        let bm_request_type = packet[0];
        let direction = if bm_request_type & REQUEST_TYPE_DIRECTION_MASK != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        let kind = match (bm_request_type & REQUEST_TYPE_KIND_MASK) >> 5 {
            0 => RequestKind::Standard,
            1 => RequestKind::Class,
            2 => RequestKind::Vendor,
            _ => return None,
        };
        let recipient = match bm_request_type & REQUEST_TYPE_RECIPIENT_MASK {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => return None,
        };
        Some(Self {
            direction,
            kind,
            recipient,
            request: packet[1],
            value: u16::from_le_bytes([packet[2], packet[3]]),
            index: u16::from_le_bytes([packet[4], packet[5]]),
            length: u16::from_le_bytes([packet[6], packet[7]]),
            data: None,
        })
    }

    /// The raw bRequest interpreted as a [`crate::types::StandardRequest`],
    /// valid only when `kind == RequestKind::Standard`.
    pub fn standard_request(&self) -> Option<crate::types::StandardRequest> {
        use packed_struct::PrimitiveEnum;
        crate::types::StandardRequest::from_primitive(self.request)
    }
}

/// Outcome of a single handler's attempt to service a request.
///
/// `NotApplicable` is the sentinel the dispatcher treats as "this handler
/// had nothing to say" -- it never counts toward the OR'd result. It
/// mirrors the `NotImplementedError` a Python handler raises when its
/// field-matching decorator doesn't apply.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    NotApplicable,
    Stall,
    Ack,
    AckWithData(Vec<u8>),
}

/// Conjunction of optional field matchers, corresponding to the keyword
/// arguments a Python `@to_this_interface`/`@standard_request_handler`
/// decorator stack would wrap a handler method with.
#[derive(Debug, Clone, Default)]
pub struct Predicate {
    pub direction: Option<Direction>,
    pub kind: Option<RequestKind>,
    pub recipient: Option<Recipient>,
    pub request: Option<u8>,
    /// Identifier matcher: the owning entity's interface number or endpoint
    /// address. Compared against the low byte of `wIndex` with the
    /// endpoint-direction bit preserved and the reserved bits masked out,
    /// since that's the only part of `wIndex` that ever encodes an
    /// interface number or endpoint address.
    pub number: Option<u16>,
}

impl Predicate {
    pub fn matches(&self, req: &ControlRequest) -> bool {
        self.direction.map_or(true, |d| d == req.direction)
            && self.kind.map_or(true, |k| k == req.kind)
            && self.recipient.map_or(true, |r| r == req.recipient)
            && self.request.map_or(true, |r| r == req.request)
            && self
                .number
                .map_or(true, |n| n == (req.index & ENDPOINT_IDENTIFIER_MASK as u16))
    }
}

/// A handler bound to a predicate, registered on a device, interface, or
/// endpoint at construction time (replacing the Python runtime scan over
/// decorated methods with a plain `Vec` built once, up front).
pub struct Handler<Ctx> {
    pub predicate: Predicate,
    pub callback: Box<dyn Fn(&mut Ctx, &ControlRequest) -> HandlerOutcome>,
}

impl<Ctx> Handler<Ctx> {
    pub fn new(
        predicate: Predicate,
        callback: impl Fn(&mut Ctx, &ControlRequest) -> HandlerOutcome + 'static,
    ) -> Self {
        Self {
            predicate,
            callback: Box::new(callback),
        }
    }
}

/// Folds one more handler's outcome into an accumulated result with an OR:
/// the first non-`NotApplicable` outcome that isn't itself immediately
/// overridden by a later `Stall` wins. Shared between [`dispatch`] (which
/// folds one handler list) and [`crate::device::Device`]'s recursive walk
/// (which folds the results of several handler lists scoped to different
/// entities, per the device/configuration/interface/endpoint order the
/// dispatch algorithm recurses through).
pub fn combine_outcomes(acc: HandlerOutcome, next: HandlerOutcome) -> HandlerOutcome {
    match next {
        HandlerOutcome::NotApplicable => acc,
        HandlerOutcome::Stall => HandlerOutcome::Stall,
        other => {
            if matches!(acc, HandlerOutcome::Stall) {
                acc
            } else {
                other
            }
        }
    }
}

/// Runs every handler whose predicate matches `req` against `ctx`, with no
/// short-circuiting; if every matching handler (or no handler at all)
/// returns `NotApplicable`, the overall result is `NotApplicable` and the
/// caller should stall the request.
pub fn dispatch<Ctx>(
    handlers: &[Handler<Ctx>],
    ctx: &mut Ctx,
    req: &ControlRequest,
) -> HandlerOutcome {
    let mut result = HandlerOutcome::NotApplicable;
    for handler in handlers {
        if !handler.predicate.matches(req) {
            continue;
        }
        let outcome = (handler.callback)(ctx, req);
        result = combine_outcomes(result, outcome);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(bm_request_type: u8, request: u8, value: u16, index: u16, length: u16) -> ControlRequest {
        let mut packet = [0u8; 8];
        packet[0] = bm_request_type;
        packet[1] = request;
        packet[2..4].copy_from_slice(&value.to_le_bytes());
        packet[4..6].copy_from_slice(&index.to_le_bytes());
        packet[6..8].copy_from_slice(&length.to_le_bytes());
        ControlRequest::from_setup_packet(&packet).unwrap()
    }

    #[test]
    fn every_matching_handler_runs() {
        let req = setup(0x80, 6, 0x0100, 0, 18);
        let calls = std::cell::RefCell::new(0);
        let handlers: Vec<Handler<()>> = vec![
            Handler::new(Predicate::default(), |_, _| {
                HandlerOutcome::NotApplicable
            }),
            Handler::new(Predicate::default(), |_, _| HandlerOutcome::Ack),
        ];
        let mut ctx = ();
        let outcome = dispatch(&handlers, &mut ctx, &req);
        let _ = calls;
        assert!(matches!(outcome, HandlerOutcome::Ack));
    }

    #[test]
    fn number_matcher_ignores_reserved_index_bits() {
        // wIndex low byte 0x83 (endpoint 3 IN) with reserved bits 6..4 set.
        let req = setup(0x80, 6, 0, 0xF3, 0);
        let predicate = Predicate {
            number: Some(0x83),
            ..Default::default()
        };
        assert!(predicate.matches(&req));

        let req = setup(0x80, 6, 0, 0x03, 0);
        assert!(!predicate.matches(&req));
    }

    #[test]
    fn unmatched_request_stalls() {
        let req = setup(0x80, 6, 0x0100, 0, 18);
        let handlers: Vec<Handler<()>> = vec![Handler::new(
            Predicate {
                request: Some(9),
                ..Default::default()
            },
            |_, _| HandlerOutcome::Ack,
        )];
        let mut ctx = ();
        let outcome = dispatch(&handlers, &mut ctx, &req);
        assert!(matches!(outcome, HandlerOutcome::NotApplicable));
    }
}
