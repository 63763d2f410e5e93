// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! STUN attributes.  Every typed attribute converts to and from a [`RawAttribute`], the
//! type-length-value form stored in a [`Message`](crate::stun::message::Message).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use byteorder::{BigEndian, ByteOrder};

use crate::stun::message::MAGIC_COOKIE;
use crate::transport::TransportError;

pub const MAPPED_ADDRESS: AttributeType = AttributeType(0x0001);
pub const USERNAME: AttributeType = AttributeType(0x0006);
pub const MESSAGE_INTEGRITY: AttributeType = AttributeType(0x0008);
pub const ERROR_CODE: AttributeType = AttributeType(0x0009);
pub const REALM: AttributeType = AttributeType(0x0014);
pub const NONCE: AttributeType = AttributeType(0x0015);
pub const XOR_MAPPED_ADDRESS: AttributeType = AttributeType(0x0020);
pub const SOFTWARE: AttributeType = AttributeType(0x8022);
pub const FINGERPRINT: AttributeType = AttributeType(0x8028);

pub const UNAUTHORIZED: u16 = 401;
pub const STALE_NONCE: u16 = 438;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeType(u16);

impl AttributeType {
    pub const fn new(val: u16) -> Self {
        Self(val)
    }

    pub fn name(self) -> &'static str {
        use crate::turn::attribute as turn;
        match self {
            MAPPED_ADDRESS => "MAPPED-ADDRESS",
            USERNAME => "USERNAME",
            MESSAGE_INTEGRITY => "MESSAGE-INTEGRITY",
            ERROR_CODE => "ERROR-CODE",
            REALM => "REALM",
            NONCE => "NONCE",
            XOR_MAPPED_ADDRESS => "XOR-MAPPED-ADDRESS",
            SOFTWARE => "SOFTWARE",
            FINGERPRINT => "FINGERPRINT",
            turn::CHANNEL_NUMBER => "CHANNEL-NUMBER",
            turn::LIFETIME => "LIFETIME",
            turn::XOR_PEER_ADDRESS => "XOR-PEER-ADDRESS",
            turn::DATA => "DATA",
            turn::XOR_RELAYED_ADDRESS => "XOR-RELAYED-ADDRESS",
            turn::REQUESTED_TRANSPORT => "REQUESTED-TRANSPORT",
            _ => "unknown",
        }
    }

    /// Types below 0x8000 must be understood by the receiver
    ///
    /// # Examples
    ///
    /// ```
    /// # use icestrans::stun::attribute::{AttributeType, SOFTWARE, USERNAME};
    /// assert!(USERNAME.comprehension_required());
    /// assert!(!SOFTWARE.comprehension_required());
    /// ```
    pub fn comprehension_required(self) -> bool {
        self.0 & 0x8000 == 0
    }
}

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#06x})", self.name(), self.0)
    }
}

impl From<u16> for AttributeType {
    fn from(val: u16) -> Self {
        Self(val)
    }
}

impl From<AttributeType> for u16 {
    fn from(atype: AttributeType) -> Self {
        atype.0
    }
}

pub trait Attribute: std::fmt::Debug {
    fn get_type(&self) -> AttributeType;

    fn to_raw(&self) -> RawAttribute;

    fn from_raw(raw: &RawAttribute) -> Result<Self, TransportError>
    where
        Self: Sized;
}

/// An attribute as found on the wire: a type and an unpadded value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAttribute {
    pub atype: AttributeType,
    pub value: Vec<u8>,
}

impl RawAttribute {
    pub fn new(atype: AttributeType, value: &[u8]) -> Self {
        Self {
            atype,
            value: value.to_vec(),
        }
    }

    /// Parse the attribute at the start of `data`.  Anything after its value is ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// # use icestrans::stun::attribute::{RawAttribute, Attribute, AttributeType};
    /// let attr = RawAttribute::from_bytes(&[0, 1, 0, 2, 5, 6, 0, 0]).unwrap();
    /// assert_eq!(attr.get_type(), AttributeType::new(1));
    /// assert_eq!(attr.value, &[5, 6]);
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        if data.len() < 4 {
            return Err(TransportError::NotEnoughData);
        }
        let atype = AttributeType(BigEndian::read_u16(&data[..2]));
        let len = BigEndian::read_u16(&data[2..4]) as usize;
        let value = data.get(4..4 + len).ok_or(TransportError::InvalidSize)?;
        Ok(Self::new(atype, value))
    }

    /// The wire form, zero padded to a multiple of four bytes
    ///
    /// # Examples
    ///
    /// ```
    /// # use icestrans::stun::attribute::{RawAttribute, AttributeType};
    /// let attr = RawAttribute::new(AttributeType::new(1), &[5, 6]);
    /// assert_eq!(attr.to_bytes(), &[0, 1, 0, 2, 5, 6, 0, 0]);
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0; self.padded_len()];
        BigEndian::write_u16(&mut buf[..2], self.atype.0);
        BigEndian::write_u16(&mut buf[2..4], self.value.len() as u16);
        buf[4..4 + self.value.len()].copy_from_slice(&self.value);
        buf
    }

    /// Size on the wire including the header and padding
    pub fn padded_len(&self) -> usize {
        4 + ((self.value.len() + 3) & !3)
    }
}

impl Attribute for RawAttribute {
    fn get_type(&self) -> AttributeType {
        self.atype
    }

    fn to_raw(&self) -> RawAttribute {
        self.clone()
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, TransportError> {
        Ok(raw.clone())
    }
}

impl std::fmt::Display for RawAttribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:02x?}", self.atype, self.value)
    }
}

pub(crate) fn check_type(raw: &RawAttribute, atype: AttributeType) -> Result<(), TransportError> {
    if raw.atype == atype {
        Ok(())
    } else {
        Err(TransportError::WrongImplementation)
    }
}

/// The value of `raw` when it is exactly `N` bytes long
pub(crate) fn fixed_value<const N: usize>(raw: &RawAttribute) -> Result<[u8; N], TransportError> {
    match raw.value.len() {
        len if len < N => Err(TransportError::NotEnoughData),
        len if len > N => Err(TransportError::TooBig),
        _ => {
            let mut buf = [0; N];
            buf.copy_from_slice(&raw.value);
            Ok(buf)
        }
    }
}

/// `TryFrom<&RawAttribute>` and `Into<RawAttribute>` for types implementing [`Attribute`]
macro_rules! raw_conversions {
    ($($name:ident),+ $(,)?) => {
        $(
            impl TryFrom<&$crate::stun::attribute::RawAttribute> for $name {
                type Error = $crate::transport::TransportError;

                fn try_from(
                    raw: &$crate::stun::attribute::RawAttribute,
                ) -> Result<Self, Self::Error> {
                    <$name as $crate::stun::attribute::Attribute>::from_raw(raw)
                }
            }

            impl From<$name> for $crate::stun::attribute::RawAttribute {
                fn from(attr: $name) -> Self {
                    $crate::stun::attribute::Attribute::to_raw(&attr)
                }
            }
        )+
    };
}
pub(crate) use raw_conversions;

// UTF-8 string valued attributes only differ in their type and maximum length
macro_rules! string_attribute {
    ($(#[$meta:meta])* $name:ident, $atype:ident, $max:literal, $getter:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(String);

        impl Attribute for $name {
            fn get_type(&self) -> AttributeType {
                $atype
            }

            fn to_raw(&self) -> RawAttribute {
                RawAttribute::new($atype, self.0.as_bytes())
            }

            fn from_raw(raw: &RawAttribute) -> Result<Self, TransportError> {
                check_type(raw, $atype)?;
                if raw.value.len() > $max {
                    return Err(TransportError::TooBig);
                }
                String::from_utf8(raw.value.clone())
                    .map(Self)
                    .map_err(|_| TransportError::Malformed)
            }
        }

        impl $name {
            pub fn new(value: &str) -> Result<Self, TransportError> {
                if value.len() > $max {
                    return Err(TransportError::InvalidSize);
                }
                Ok(Self(value.to_owned()))
            }

            pub fn $getter(&self) -> &str {
                &self.0
            }
        }

        raw_conversions!($name);
    };
}

string_attribute!(Username, USERNAME, 513, username);
string_attribute!(Software, SOFTWARE, 763, software);
string_attribute!(
    /// Authentication realm announced by a server in a 401 response
    Realm,
    REALM,
    763,
    realm
);
string_attribute!(Nonce, NONCE, 763, nonce);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    code: u16,
    reason: String,
}

impl Attribute for ErrorCode {
    fn get_type(&self) -> AttributeType {
        ERROR_CODE
    }

    fn to_raw(&self) -> RawAttribute {
        // class in the low bits of the third byte, number in the fourth
        let mut value = vec![0, 0, (self.code / 100) as u8, (self.code % 100) as u8];
        value.extend_from_slice(self.reason.as_bytes());
        RawAttribute::new(ERROR_CODE, &value)
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, TransportError> {
        check_type(raw, ERROR_CODE)?;
        let (header, reason) = match raw.value.len() {
            len if len < 4 => return Err(TransportError::NotEnoughData),
            len if len > 4 + 763 => return Err(TransportError::TooBig),
            _ => raw.value.split_at(4),
        };
        let class = (header[2] & 0x7) as u16;
        let number = header[3] as u16;
        if !(3..=6).contains(&class) || number > 99 {
            return Err(TransportError::Malformed);
        }
        Ok(Self {
            code: class * 100 + number,
            reason: String::from_utf8(reason.to_vec()).map_err(|_| TransportError::Malformed)?,
        })
    }
}

impl ErrorCode {
    /// `code` must be a 3xx to 6xx error
    pub fn new(code: u16, reason: &str) -> Result<Self, TransportError> {
        if !(300..700).contains(&code) {
            return Err(TransportError::Malformed);
        }
        Ok(Self {
            code,
            reason: reason.to_owned(),
        })
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Encode the family/port/address triple shared by all address attributes.
pub(crate) fn address_to_bytes(addr: SocketAddr) -> Vec<u8> {
    let (family, octets) = match addr.ip() {
        IpAddr::V4(ip) => (0x1, ip.octets().to_vec()),
        IpAddr::V6(ip) => (0x2, ip.octets().to_vec()),
    };
    let mut buf = vec![0, family, 0, 0];
    BigEndian::write_u16(&mut buf[2..4], addr.port());
    buf.extend_from_slice(&octets);
    buf
}

pub(crate) fn address_from_bytes(value: &[u8]) -> Result<SocketAddr, TransportError> {
    let expected = match value.get(1) {
        Some(0x1) => 8,
        Some(0x2) => 20,
        Some(_) => return Err(TransportError::Malformed),
        None => return Err(TransportError::NotEnoughData),
    };
    if value.len() < expected {
        return Err(TransportError::NotEnoughData);
    } else if value.len() > expected {
        return Err(TransportError::TooBig);
    }
    let port = BigEndian::read_u16(&value[2..4]);
    let ip = if expected == 8 {
        IpAddr::V4(Ipv4Addr::from(BigEndian::read_u32(&value[4..8])))
    } else {
        IpAddr::V6(Ipv6Addr::from(BigEndian::read_u128(&value[4..20])))
    };
    Ok(SocketAddr::new(ip, port))
}

/// XOR an address with the magic cookie (and the transaction id for IPv6).  Applying it twice
/// yields the original address.
pub(crate) fn xor_address(addr: SocketAddr, transaction: u128) -> SocketAddr {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = match addr.ip() {
        IpAddr::V4(ip) => IpAddr::V4(Ipv4Addr::from(u32::from(ip) ^ MAGIC_COOKIE)),
        IpAddr::V6(ip) => {
            let mask = (MAGIC_COOKIE as u128) << 96 | (transaction & ((1 << 96) - 1));
            IpAddr::V6(Ipv6Addr::from(u128::from(ip) ^ mask))
        }
    };
    SocketAddr::new(ip, port)
}

/// The legacy (RFC 3489) non-XOR'd mapped address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedAddress(SocketAddr);

impl Attribute for MappedAddress {
    fn get_type(&self) -> AttributeType {
        MAPPED_ADDRESS
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(MAPPED_ADDRESS, &address_to_bytes(self.0))
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, TransportError> {
        check_type(raw, MAPPED_ADDRESS)?;
        address_from_bytes(&raw.value).map(Self)
    }
}

impl MappedAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

/// Address attributes stored XOR'd with the magic cookie.  The transaction id is needed to
/// recover an IPv6 address so the stored form stays XOR'd.
macro_rules! xor_address_attribute {
    ($(#[$meta:meta])* $name:ident, $atype:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            xored: std::net::SocketAddr,
        }

        impl $crate::stun::attribute::Attribute for $name {
            fn get_type(&self) -> $crate::stun::attribute::AttributeType {
                $atype
            }

            fn to_raw(&self) -> $crate::stun::attribute::RawAttribute {
                $crate::stun::attribute::RawAttribute::new(
                    $atype,
                    &$crate::stun::attribute::address_to_bytes(self.xored),
                )
            }

            fn from_raw(
                raw: &$crate::stun::attribute::RawAttribute,
            ) -> Result<Self, $crate::transport::TransportError> {
                $crate::stun::attribute::check_type(raw, $atype)?;
                Ok(Self {
                    xored: $crate::stun::attribute::address_from_bytes(&raw.value)?,
                })
            }
        }

        impl $name {
            pub fn new(addr: std::net::SocketAddr, transaction: u128) -> Self {
                Self {
                    xored: $crate::stun::attribute::xor_address(addr, transaction),
                }
            }

            pub fn addr(&self, transaction: u128) -> std::net::SocketAddr {
                $crate::stun::attribute::xor_address(self.xored, transaction)
            }
        }

        $crate::stun::attribute::raw_conversions!($name);
    };
}
pub(crate) use xor_address_attribute;

xor_address_attribute!(XorMappedAddress, XOR_MAPPED_ADDRESS);

/// HMAC-SHA1 over the message up to this attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIntegrity([u8; 20]);

impl Attribute for MessageIntegrity {
    fn get_type(&self) -> AttributeType {
        MESSAGE_INTEGRITY
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(MESSAGE_INTEGRITY, &self.0)
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, TransportError> {
        check_type(raw, MESSAGE_INTEGRITY)?;
        fixed_value(raw).map(Self)
    }
}

impl MessageIntegrity {
    pub fn new(hmac: [u8; 20]) -> Self {
        Self(hmac)
    }

    pub fn hmac(&self) -> &[u8; 20] {
        &self.0
    }
}

/// CRC-32 of the message up to this attribute.  The XOR with `0x5354554e` happens on the wire
/// only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint(u32);

impl Fingerprint {
    pub const XOR_CONSTANT: u32 = 0x5354_554e;

    pub fn new(fingerprint: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(fingerprint))
    }

    pub fn fingerprint(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl Attribute for Fingerprint {
    fn get_type(&self) -> AttributeType {
        FINGERPRINT
    }

    fn to_raw(&self) -> RawAttribute {
        RawAttribute::new(FINGERPRINT, &(self.0 ^ Self::XOR_CONSTANT).to_be_bytes())
    }

    fn from_raw(raw: &RawAttribute) -> Result<Self, TransportError> {
        check_type(raw, FINGERPRINT)?;
        let wire = u32::from_be_bytes(fixed_value(raw)?);
        Ok(Self(wire ^ Self::XOR_CONSTANT))
    }
}

raw_conversions!(ErrorCode, MappedAddress, MessageIntegrity, Fingerprint);

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        crate::tests::test_init_log();
    }

    #[test]
    fn raw_attribute_padding() {
        init();
        let a = RawAttribute::new(1.into(), &[80, 160, 7]);
        assert_eq!(a.padded_len(), 8);
        let bytes = a.to_bytes();
        assert_eq!(bytes, &[0, 1, 0, 3, 80, 160, 7, 0]);
        assert_eq!(RawAttribute::from_bytes(&bytes).unwrap(), a);
    }

    #[test]
    fn raw_attribute_advertised_length_too_long() {
        init();
        assert!(matches!(
            RawAttribute::from_bytes(&[0, 1, 0, 8, 1, 2]),
            Err(TransportError::InvalidSize)
        ));
        assert!(matches!(
            RawAttribute::from_bytes(&[0, 1]),
            Err(TransportError::NotEnoughData)
        ));
    }

    #[test]
    fn attribute_type_display() {
        init();
        assert_eq!(XOR_MAPPED_ADDRESS.to_string(), "XOR-MAPPED-ADDRESS(0x0020)");
        assert_eq!(AttributeType::new(0x7777).name(), "unknown");
    }

    #[test]
    fn string_attributes() {
        init();
        let realm = Realm::new("example.org").unwrap();
        assert_eq!(realm.get_type(), REALM);
        let raw: RawAttribute = realm.into();
        assert_eq!(Realm::try_from(&raw).unwrap().realm(), "example.org");
        // wrong type is refused
        assert!(matches!(
            Nonce::try_from(&raw),
            Err(TransportError::WrongImplementation)
        ));
        assert!(Username::new(&"a".repeat(600)).is_err());
        let invalid = RawAttribute::new(SOFTWARE, &[0xff, 0xfe]);
        assert!(matches!(
            Software::try_from(&invalid),
            Err(TransportError::Malformed)
        ));
    }

    #[test]
    fn error_code() {
        init();
        let codes = [
            (300, "Try Alternate"),
            (401, "Unauthorized"),
            (438, "Stale Nonce"),
            (699, ""),
        ];
        for (code, reason) in codes {
            let raw: RawAttribute = ErrorCode::new(code, reason).unwrap().into();
            let parsed = ErrorCode::try_from(&raw).unwrap();
            assert_eq!(parsed.code(), code);
            assert_eq!(parsed.reason(), reason);
        }
        assert!(ErrorCode::new(200, "OK").is_err());
        let raw: RawAttribute = ErrorCode::new(420, "Unknown Attribute").unwrap().into();
        assert_eq!(&raw.value[..4], &[0, 0, 4, 20]);
        // truncated error codes are not a panic
        let raw = RawAttribute::new(ERROR_CODE, &[0, 0]);
        assert!(ErrorCode::try_from(&raw).is_err());
    }

    #[test]
    fn xor_mapped_address_v4_and_v6() {
        init();
        let transaction_id = 0x9876_5432_1098_7654_3210_9876;
        let addrs: [SocketAddr; 2] = [
            "192.168.0.1:40000".parse().unwrap(),
            "[2001:db8::1]:50000".parse().unwrap(),
        ];
        for addr in addrs {
            let mapped = XorMappedAddress::new(addr, transaction_id);
            assert_eq!(mapped.addr(transaction_id), addr);
            let raw: RawAttribute = mapped.into();
            assert_ne!(address_from_bytes(&raw.value).unwrap(), addr);
            let parsed = XorMappedAddress::try_from(&raw).unwrap();
            assert_eq!(parsed.addr(transaction_id), addr);
        }
    }

    #[test]
    fn xor_mapped_address_wire_format() {
        init();
        // RFC 5769 section 2.2
        let raw: RawAttribute =
            XorMappedAddress::new("192.0.2.1:32853".parse().unwrap(), 0).into();
        assert_eq!(raw.value, &[0x00, 0x01, 0xa1, 0x47, 0xe1, 0x12, 0xa6, 0x43]);
    }

    #[test]
    fn mapped_address_is_not_xored() {
        init();
        let addr: SocketAddr = "203.0.113.9:3478".parse().unwrap();
        let raw: RawAttribute = MappedAddress::new(addr).into();
        assert_eq!(&raw.value[4..8], &[203, 0, 113, 9]);
        assert_eq!(MappedAddress::try_from(&raw).unwrap().addr(), addr);
    }

    #[test]
    fn bad_address_family() {
        init();
        let raw = RawAttribute::new(MAPPED_ADDRESS, &[0, 3, 0, 1, 1, 2, 3, 4]);
        assert!(matches!(
            MappedAddress::try_from(&raw),
            Err(TransportError::Malformed)
        ));
        let raw = RawAttribute::new(MAPPED_ADDRESS, &[0, 1, 0, 1, 1, 2, 3, 4, 5]);
        assert!(matches!(
            MappedAddress::try_from(&raw),
            Err(TransportError::TooBig)
        ));
    }

    #[test]
    fn fingerprint_and_integrity_sizes() {
        init();
        let attr = Fingerprint::new([1; 4]);
        let raw: RawAttribute = attr.clone().into();
        assert_eq!(raw.value, &[0x52, 0x55, 0x54, 0x4f]);
        assert_eq!(Fingerprint::try_from(&raw).unwrap(), attr);
        let short = RawAttribute::new(FINGERPRINT, &[1, 2]);
        assert!(matches!(
            Fingerprint::try_from(&short),
            Err(TransportError::NotEnoughData)
        ));
        let long = RawAttribute::new(MESSAGE_INTEGRITY, &[0; 24]);
        assert!(matches!(
            MessageIntegrity::try_from(&long),
            Err(TransportError::TooBig)
        ));
    }
}
