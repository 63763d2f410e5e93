// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! TURN (RFC 5766) attributes

use std::time::Duration;

use crate::stun::attribute::{
    check_type, fixed_value, raw_conversions, xor_address_attribute, Attribute, AttributeType,
    RawAttribute,
};
use crate::transport::TransportError;

pub const CHANNEL_NUMBER: AttributeType = AttributeType::new(0x000C);
pub const LIFETIME: AttributeType = AttributeType::new(0x000D);
pub const XOR_PEER_ADDRESS: AttributeType = AttributeType::new(0x0012);
pub const DATA: AttributeType = AttributeType::new(0x0013);
pub const XOR_RELAYED_ADDRESS: AttributeType = AttributeType::new(0x0016);
pub const REQUESTED_TRANSPORT: AttributeType = AttributeType::new(0x0019);

/// IANA protocol number for UDP
pub const TRANSPORT_UDP: u8 = 17;

/// Allocation lifetime in whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime(u32);

impl Attribute for Lifetime {
    fn get_type(&self) -> AttributeType {
        LIFETIME
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(LIFETIME, &self.0.to_be_bytes())
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, TransportError> {
        check_type(raw, LIFETIME)?;
        fixed_value(raw).map(|secs| Self(u32::from_be_bytes(secs)))
    }
}

impl Lifetime {
    pub fn new(lifetime: Duration) -> Self {
        Self(u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX))
    }

    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.0.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedTransport(u8);

impl Attribute for RequestedTransport {
    fn get_type(&self) -> AttributeType {
        REQUESTED_TRANSPORT
    }

    fn to_raw(&self) -> RawAttribute {
        // protocol followed by three reserved bytes
        RawAttribute::new(REQUESTED_TRANSPORT, &[self.0, 0, 0, 0])
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, TransportError> {
        check_type(raw, REQUESTED_TRANSPORT)?;
        let [protocol, ..] = fixed_value::<4>(raw).map_err(|_| TransportError::InvalidSize)?;
        Ok(Self(protocol))
    }
}

impl RequestedTransport {
    pub fn new(protocol: u8) -> Self {
        Self(protocol)
    }

    pub fn protocol(&self) -> u8 {
        self.0
    }
}

xor_address_attribute!(
    /// Where a relayed packet came from or should go to
    XorPeerAddress,
    XOR_PEER_ADDRESS
);
xor_address_attribute!(
    /// The address the server allocated for the client
    XorRelayedAddress,
    XOR_RELAYED_ADDRESS
);

/// The payload of a SEND or DATA indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data(Vec<u8>);

impl Attribute for Data {
    fn get_type(&self) -> AttributeType {
        DATA
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(DATA, &self.0)
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, TransportError> {
        check_type(raw, DATA)?;
        Ok(Self(raw.value.clone()))
    }
}

impl Data {
    pub fn new(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() > u16::MAX as usize {
            return Err(TransportError::TooBig);
        }
        Ok(Self(data.to_vec()))
    }

    pub fn data(&self) -> &[u8] {
        &self.0
    }

    pub fn into_data(self) -> Vec<u8> {
        self.0
    }
}

raw_conversions!(Lifetime, RequestedTransport, Data);
