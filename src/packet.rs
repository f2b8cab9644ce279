//! The opaque packet carrier the pump (§4.7) hands off to the application.
//!
//! Decoding past the fixed header is explicitly out of core scope (spec §1);
//! `Packet` only needs to let the application read the body and the frame's
//! type without the pump dictating a richer message model.

use bytes::Bytes;

/// One fully parsed frame: header fields plus the body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    msg_type: u16,
    body: Bytes,
}

impl Packet {
    pub(crate) fn new(msg_type: u16, body: Bytes) -> Self {
        Packet { msg_type, body }
    }

    pub fn msg_type(&self) -> u16 {
        self.msg_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}
