// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};

use crate::stun::attribute::*;
use crate::transport::TransportError;

pub const MAGIC_COOKIE: u32 = 0x2112A442;

pub const BINDING: u16 = 0x0001;

const HEADER_LEN: usize = 20;
const TRANSACTION_MASK: u128 = 0x0000_0000_ffff_ffff_ffff_ffff_ffff_ffff;

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongTermCredentials {
    pub username: String,
    pub realm: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortTermCredentials {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageIntegrityCredentials {
    ShortTerm(ShortTermCredentials),
    LongTerm(LongTermCredentials),
}

impl MessageIntegrityCredentials {
    fn make_hmac_key(&self) -> Vec<u8> {
        match self {
            MessageIntegrityCredentials::ShortTerm(short) => short.password.as_bytes().to_vec(),
            MessageIntegrityCredentials::LongTerm(long) => {
                let data = format!("{}:{}:{}", long.username, long.realm, long.password);
                Md5::digest(data.as_bytes()).to_vec()
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageClass {
    Request,
    Indication,
    Success,
    Error,
}

impl MessageClass {
    pub fn is_response(self) -> bool {
        matches!(self, MessageClass::Success | MessageClass::Error)
    }
}

// The two class bits are interleaved with the method at bits 4 and 8 of the type
const CLASS_MASK: u16 = 0x0110;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MessageType(u16);

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} {}",
            self.class(),
            crate::turn::method_name(self.method())
        )
    }
}

impl MessageType {
    pub fn class(self) -> MessageClass {
        match self.0 & CLASS_MASK {
            0x0000 => MessageClass::Request,
            0x0010 => MessageClass::Indication,
            0x0100 => MessageClass::Success,
            _ => MessageClass::Error,
        }
    }

    pub fn is_response(self) -> bool {
        self.class().is_response()
    }

    pub fn method(self) -> u16 {
        let bits = self.0 & !CLASS_MASK;
        (bits & 0x000f) | ((bits >> 1) & 0x0070) | ((bits >> 2) & 0x0f80)
    }

    pub fn from_class_method(class: MessageClass, method: u16) -> Self {
        let class = match class {
            MessageClass::Request => 0x0000,
            MessageClass::Indication => 0x0010,
            MessageClass::Success => 0x0100,
            MessageClass::Error => 0x0110,
        };
        let method = (method & 0x000f) | ((method & 0x0070) << 1) | ((method & 0x0f80) << 2);
        Self(class | method)
    }

    /// Parse the first two bytes of a message.  The top two bits of a STUN message are zero.
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        match data {
            [hi, lo, ..] if hi & 0xc0 == 0 => Ok(Self(u16::from_be_bytes([*hi, *lo]))),
            [_, _, ..] => Err(TransportError::Malformed),
            _ => Err(TransportError::NotEnoughData),
        }
    }
}

/// Cheap structural check for whether a received datagram looks like a STUN message.
///
/// Only the header is inspected: the length, the first byte (always `0x00` or `0x01`), and
/// that the advertised length covers exactly the datagram.  When the magic cookie is present and
/// the last attribute is a FINGERPRINT, the CRC must also match.
///
/// # Examples
///
/// ```
/// # use icestrans::stun::message::{is_stun_message, Message, BINDING};
/// let mut msg = Message::new_request_method(BINDING);
/// msg.add_fingerprint().unwrap();
/// let bytes = msg.to_bytes();
/// assert!(is_stun_message(&bytes));
/// assert!(!is_stun_message(&bytes[..bytes.len() - 4]));
/// assert!(!is_stun_message(&[0x80; 40]));
/// ```
pub fn is_stun_message(data: &[u8]) -> bool {
    if data.len() < HEADER_LEN {
        return false;
    }
    if data[0] != 0x00 && data[0] != 0x01 {
        return false;
    }
    let msg_len = BigEndian::read_u16(&data[2..4]) as usize;
    if msg_len + HEADER_LEN != data.len() {
        return false;
    }

    if BigEndian::read_u32(&data[4..8]) == MAGIC_COOKIE && msg_len >= 8 {
        // FINGERPRINT is always the last attribute when present
        let attr_offset = data.len() - 8;
        if AttributeType::new(BigEndian::read_u16(&data[attr_offset..])) == FINGERPRINT {
            if BigEndian::read_u16(&data[attr_offset + 2..]) != 4 {
                return false;
            }
            let expected = BigEndian::read_u32(&data[attr_offset + 4..]);
            let crc = CRC32.checksum(&data[..attr_offset]) ^ Fingerprint::XOR_CONSTANT;
            if crc != expected {
                trace!("fingerprint mismatch {:#x} != {:#x}", crc, expected);
                return false;
            }
        }
    }
    true
}

/// Read the type and transaction id from the header of a STUN message without parsing any of
/// the attributes.
pub fn parse_header(data: &[u8]) -> Result<(MessageType, u128), TransportError> {
    if data.len() < HEADER_LEN {
        return Err(TransportError::NotEnoughData);
    }
    let mtype = MessageType::from_bytes(data)?;
    let tid = BigEndian::read_u128(&data[4..]);
    if (tid >> 96) as u32 != MAGIC_COOKIE {
        return Err(TransportError::Malformed);
    }
    Ok((mtype, tid & TRANSACTION_MASK))
}

/// Walks the attributes of a serialized message, yielding each with its offset
struct Attributes<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Attributes<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: HEADER_LEN,
        }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = Result<(usize, RawAttribute), TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let offset = self.offset;
        let attr = match RawAttribute::from_bytes(&self.data[offset..]) {
            Ok(attr) => attr,
            Err(e) => {
                self.offset = self.data.len();
                return Some(Err(e));
            }
        };
        if offset + attr.padded_len() > self.data.len() {
            self.offset = self.data.len();
            return Some(Err(TransportError::Malformed));
        }
        self.offset += attr.padded_len();
        Some(Ok((offset, attr)))
    }
}

/// The bytes before `offset` with the header length rewritten to also cover an attribute of
/// `attr_len` bytes at `offset`.  MESSAGE-INTEGRITY and FINGERPRINT are computed over this.
fn covered_prefix(data: &[u8], offset: usize, attr_len: usize) -> Vec<u8> {
    let mut prefix = data[..offset].to_vec();
    BigEndian::write_u16(&mut prefix[2..4], (offset - HEADER_LEN + attr_len) as u16);
    prefix
}

fn integrity_hmac(
    credentials: &MessageIntegrityCredentials,
    data: &[u8],
) -> Result<Hmac<sha1::Sha1>, TransportError> {
    let mut hmac = Hmac::<sha1::Sha1>::new_from_slice(&credentials.make_hmac_key())
        .map_err(|_| TransportError::Malformed)?;
    hmac.update(data);
    Ok(hmac)
}

#[derive(Debug, Clone)]
pub struct Message {
    msg_type: MessageType,
    /// only the low 96 bits are used
    transaction: u128,
    attributes: Vec<RawAttribute>,
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.attributes.iter().map(|a| a.atype.name()).collect();
        write!(
            f,
            "{} {:#026x} [{}]",
            self.msg_type,
            self.transaction,
            names.join(", ")
        )
    }
}

impl Message {
    pub fn new(mtype: MessageType, transaction: u128) -> Self {
        Self {
            msg_type: mtype,
            transaction: transaction & TRANSACTION_MASK,
            attributes: vec![],
        }
    }

    pub fn new_request_method(method: u16) -> Self {
        Self::new(
            MessageType::from_class_method(MessageClass::Request, method),
            Self::generate_transaction(),
        )
    }

    pub fn new_indication_method(method: u16) -> Self {
        Self::new(
            MessageType::from_class_method(MessageClass::Indication, method),
            Self::generate_transaction(),
        )
    }

    /// A response to `request` of the given class, with the same method and transaction
    fn response(request: &Message, class: MessageClass) -> Self {
        Self::new(
            MessageType::from_class_method(class, request.method()),
            request.transaction,
        )
    }

    pub fn new_success(request: &Message) -> Self {
        Self::response(request, MessageClass::Success)
    }

    pub fn new_error(request: &Message) -> Self {
        Self::response(request, MessageClass::Error)
    }

    pub fn get_type(&self) -> MessageType {
        self.msg_type
    }

    pub fn class(&self) -> MessageClass {
        self.msg_type.class()
    }

    pub fn has_class(&self, class: MessageClass) -> bool {
        self.class() == class
    }

    pub fn is_response(&self) -> bool {
        self.msg_type.is_response()
    }

    pub fn method(&self) -> u16 {
        self.msg_type.method()
    }

    pub fn has_method(&self, method: u16) -> bool {
        self.method() == method
    }

    pub fn transaction_id(&self) -> u128 {
        self.transaction
    }

    pub fn generate_transaction() -> u128 {
        rand::random::<u128>() & TRANSACTION_MASK
    }

    /// Serialize a `Message` to network bytes
    ///
    /// # Examples
    ///
    /// ```
    /// # use icestrans::stun::attribute::RawAttribute;
    /// # use icestrans::stun::message::{Message, MessageType, MessageClass, BINDING};
    /// let mut message = Message::new(MessageType::from_class_method(MessageClass::Request, BINDING), 1000);
    /// message.add_attribute(RawAttribute::new(1.into(), &[3])).unwrap();
    /// assert_eq!(
    ///     message.to_bytes(),
    ///     [0, 1, 0, 8, 0x21, 0x12, 0xa4, 0x42, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x03, 0xe8, 0, 1, 0, 1, 3, 0, 0, 0]
    /// );
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let body: Vec<u8> = self.attributes.iter().flat_map(|a| a.to_bytes()).collect();
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(&self.msg_type.0.to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(&((MAGIC_COOKIE as u128) << 96 | self.transaction).to_be_bytes());
        out.extend(body);
        out
    }

    /// Deserialize a `Message`.  A FINGERPRINT, if present, is validated.
    ///
    /// # Examples
    ///
    /// ```
    /// # use icestrans::stun::attribute::RawAttribute;
    /// # use icestrans::stun::message::{Message, MessageType, MessageClass, BINDING};
    /// let data = [0, 1, 0, 8, 0x21, 0x12, 0xa4, 0x42, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x03, 0xe8, 0, 1, 0, 1, 3, 0, 0, 0];
    /// let message = Message::from_bytes(&data).unwrap();
    /// assert_eq!(message.get_attribute(1.into()), Some(&RawAttribute::new(1.into(), &[3])));
    /// assert_eq!(message.get_type(), MessageType::from_class_method(MessageClass::Request, BINDING));
    /// assert_eq!(message.transaction_id(), 1000);
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self, TransportError> {
        let (mtype, tid) = parse_header(data)?;
        let total = HEADER_LEN + BigEndian::read_u16(&data[2..4]) as usize;
        let data = data.get(..total).ok_or_else(|| {
            debug!("advertised size {} exceeds {} bytes", total, data.len());
            TransportError::Malformed
        })?;

        let mut msg = Self::new(mtype, tid);
        for item in Attributes::new(data) {
            let (offset, attr) = item?;
            if msg.has_attribute(MESSAGE_INTEGRITY) && attr.atype != FINGERPRINT {
                debug!("unexpected attribute {} after MESSAGE-INTEGRITY", attr.atype);
                return Err(TransportError::Malformed);
            }
            if attr.atype == FINGERPRINT {
                let expected = Fingerprint::from_raw(&attr)?.fingerprint();
                let crc = CRC32
                    .checksum(&covered_prefix(data, offset, attr.padded_len()))
                    .to_be_bytes();
                if crc != expected {
                    debug!("fingerprint mismatch {:02x?} != {:02x?}", crc, expected);
                    return Err(TransportError::Malformed);
                }
            }
            msg.attributes.push(attr);
        }
        Ok(msg)
    }

    /// Validate the MESSAGE-INTEGRITY of `orig_data` (the bytes this message was parsed from).
    pub fn validate_integrity(
        &self,
        orig_data: &[u8],
        credentials: &MessageIntegrityCredentials,
    ) -> Result<(), TransportError> {
        let raw = self
            .get_attribute(MESSAGE_INTEGRITY)
            .ok_or(TransportError::ResourceNotFound)?;
        let integrity = MessageIntegrity::try_from(raw)?;

        for item in Attributes::new(orig_data) {
            let (offset, attr) = item?;
            if attr.atype == MESSAGE_INTEGRITY {
                let covered = covered_prefix(orig_data, offset, attr.padded_len());
                return integrity_hmac(credentials, &covered)?
                    .verify_slice(integrity.hmac())
                    .map_err(|_| TransportError::IntegrityCheckFailed);
            }
        }
        Err(TransportError::Malformed)
    }

    pub fn add_message_integrity(
        &mut self,
        credentials: &MessageIntegrityCredentials,
    ) -> Result<(), TransportError> {
        if self.has_attribute(MESSAGE_INTEGRITY) || self.has_attribute(FINGERPRINT) {
            return Err(TransportError::AlreadyExists);
        }
        let bytes = self.to_bytes();
        let covered = covered_prefix(&bytes, bytes.len(), 24);
        let hmac = integrity_hmac(credentials, &covered)?.finalize().into_bytes();
        self.attributes.push(MessageIntegrity::new(hmac.into()).into());
        Ok(())
    }

    pub fn add_fingerprint(&mut self) -> Result<(), TransportError> {
        if self.has_attribute(FINGERPRINT) {
            return Err(TransportError::AlreadyExists);
        }
        let bytes = self.to_bytes();
        let crc = CRC32.checksum(&covered_prefix(&bytes, bytes.len(), 8));
        self.attributes.push(Fingerprint::new(crc.to_be_bytes()).into());
        Ok(())
    }

    /// Add an `Attribute` to this `Message`.  Only one `Attribute` of each `AttributeType` can
    /// be added and nothing can follow MESSAGE-INTEGRITY or FINGERPRINT.
    ///
    /// # Examples
    ///
    /// ```
    /// # use icestrans::stun::attribute::RawAttribute;
    /// # use icestrans::stun::message::{Message, BINDING};
    /// let mut message = Message::new_request_method(BINDING);
    /// let attr = RawAttribute::new(1.into(), &[3]);
    /// assert!(message.add_attribute(attr.clone()).is_ok());
    /// assert!(message.add_attribute(attr).is_err());
    /// ```
    pub fn add_attribute(&mut self, attr: RawAttribute) -> Result<(), TransportError> {
        if attr.atype == MESSAGE_INTEGRITY || attr.atype == FINGERPRINT {
            return Err(TransportError::WrongImplementation);
        }
        let sealed = self.has_attribute(MESSAGE_INTEGRITY) || self.has_attribute(FINGERPRINT);
        if sealed || self.has_attribute(attr.atype) {
            return Err(TransportError::AlreadyExists);
        }
        self.attributes.push(attr);
        Ok(())
    }

    pub fn get_attribute(&self, atype: AttributeType) -> Option<&RawAttribute> {
        self.attributes.iter().find(|attr| attr.atype == atype)
    }

    pub fn has_attribute(&self, atype: AttributeType) -> bool {
        self.get_attribute(atype).is_some()
    }

    pub fn iter_attributes(&self) -> impl Iterator<Item = &RawAttribute> {
        self.attributes.iter()
    }

    /// The ERROR-CODE of an error response, if it has a parseable one
    pub fn error_code(&self) -> Option<ErrorCode> {
        self.get_attribute(ERROR_CODE)
            .and_then(|raw| ErrorCode::try_from(raw).ok())
    }
}

impl From<Message> for Vec<u8> {
    fn from(msg: Message) -> Self {
        msg.to_bytes()
    }
}

impl TryFrom<&[u8]> for Message {
    type Error = TransportError;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        Message::from_bytes(data)
    }
}
