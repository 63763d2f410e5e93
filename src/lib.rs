// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! ICE stream transport.
//!
//! Owns one UDP socket per media component, gathers host, server-reflexive and relayed
//! candidates for it, keeps NAT bindings alive and demultiplexes inbound datagrams between the
//! STUN client, an external ICE connectivity-check engine and the application.

#[macro_use]
extern crate tracing;

#[macro_use]
extern crate derivative;

pub mod candidate;
mod component;
pub mod config;
pub mod engine;
mod keepalive;
mod router;
pub mod socket;
pub mod stun;
pub mod transport;
pub mod turn;
