// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! TURN (RFC 5766) relay allocation over UDP

pub mod attribute;
pub(crate) mod client;

pub use client::{Allocation, TurnClient, TurnEvent, TurnState};

pub const ALLOCATE: u16 = 0x0003;
pub const REFRESH: u16 = 0x0004;
pub const SEND: u16 = 0x0006;
pub const DATA: u16 = 0x0007;
pub const CREATE_PERMISSION: u16 = 0x0008;
pub const CHANNEL_BIND: u16 = 0x0009;

/// Human readable name of a STUN/TURN method
pub fn method_name(method: u16) -> &'static str {
    match method {
        crate::stun::message::BINDING => "BINDING",
        ALLOCATE => "ALLOCATE",
        REFRESH => "REFRESH",
        SEND => "SEND",
        DATA => "DATA",
        CREATE_PERMISSION => "CREATE-PERMISSION",
        CHANNEL_BIND => "CHANNEL-BIND",
        _ => "unknown",
    }
}
