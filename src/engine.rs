// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Interface to the ICE connectivity-check engine.
//!
//! The transport never pairs or checks candidates itself.  An [`IceEngineFactory`] creates an
//! [`IceEngine`] on `init_ice`, the transport feeds it local candidates and inbound packets and
//! executes the sends it requests through the [`EngineSink`] it was created with.

use std::net::SocketAddr;

use crate::candidate::{Candidate, CandidateType};
use crate::transport::{TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceRole {
    Controlling,
    Controlled,
}

/// A candidate as handed to, or received from, the ICE engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCandidate {
    pub component_id: usize,
    pub candidate_type: CandidateType,
    pub priority: u32,
    pub foundation: String,
    pub address: SocketAddr,
    pub base_address: SocketAddr,
    pub related_address: Option<SocketAddr>,
}

impl From<&Candidate> for SessionCandidate {
    fn from(c: &Candidate) -> Self {
        Self {
            component_id: c.component_id,
            candidate_type: c.candidate_type,
            priority: c.priority,
            foundation: c.foundation.clone(),
            address: c.address,
            base_address: c.base_address,
            related_address: c.related_address,
        }
    }
}

pub trait IceEngine: Send {
    /// Add a local candidate, returning the engine's index for it
    fn add_candidate(&mut self, candidate: &SessionCandidate) -> Result<usize, TransportError>;

    /// Start connectivity checks against the remote candidates
    fn start_check(
        &mut self,
        remote_ufrag: &str,
        remote_pwd: &str,
        remote_candidates: &[SessionCandidate],
    ) -> Result<(), TransportError>;

    /// A STUN-shaped packet received on `candidate` (an engine index)
    fn on_rx_pkt(&mut self, component_id: usize, candidate: usize, data: &[u8], from: SocketAddr);

    fn destroy(&mut self) {}
}

pub trait IceEngineFactory: Send + Sync {
    fn create(
        &self,
        role: IceRole,
        local_ufrag: &str,
        local_pwd: &str,
        sink: EngineSink,
    ) -> Result<Box<dyn IceEngine>, TransportError>;
}

/// Callbacks from the engine into the transport.  Everything is queued and handled on the
/// transport's dispatch task so calling these from inside any `IceEngine` method is fine.
/// Requests from a session that has since been stopped are ignored.
#[derive(Debug, Clone)]
pub struct EngineSink {
    session: u64,
    events: async_channel::Sender<TransportEvent>,
}

impl EngineSink {
    pub(crate) fn new(session: u64, events: async_channel::Sender<TransportEvent>) -> Self {
        Self { session, events }
    }

    fn post(&self, event: TransportEvent) -> Result<(), TransportError> {
        self.events
            .try_send(event)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Send `data` to `to` from the local candidate with engine index `candidate`.  Relayed
    /// candidates are sent through their TURN allocation.
    pub fn send_packet(
        &self,
        component_id: usize,
        candidate: usize,
        data: &[u8],
        to: SocketAddr,
    ) -> Result<(), TransportError> {
        self.post(TransportEvent::EngineTransmit {
            session: self.session,
            component_id,
            candidate,
            data: data.to_vec(),
            to,
        })
    }

    /// Pass non-ICE data to the application
    pub fn deliver_data(
        &self,
        component_id: usize,
        data: &[u8],
        from: SocketAddr,
    ) -> Result<(), TransportError> {
        self.post(TransportEvent::EngineData {
            session: self.session,
            component_id,
            data: data.to_vec(),
            from,
        })
    }

    pub fn ice_complete(&self, result: Result<(), TransportError>) -> Result<(), TransportError> {
        self.post(TransportEvent::EngineComplete {
            session: self.session,
            result,
        })
    }
}
