// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::AbortHandle;
use futures_timer::Delay;
use tracing_futures::Instrument;

use crate::candidate::CandidateStatus;
use crate::config::RetransmitConfig;
use crate::socket::UdpSocketChannel;
use crate::stun::attribute::*;
use crate::stun::message::*;
use crate::transport::{TransportError, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindingKind {
    /// Initial discovery of the server reflexive address
    Resolve,
    KeepAlive,
}

#[derive(Debug)]
pub(crate) struct StunOutcome {
    pub(crate) kind: BindingKind,
    pub(crate) result: Result<SocketAddr, TransportError>,
}

#[derive(Debug)]
struct Outstanding {
    transaction: u128,
    kind: BindingKind,
    abort: AbortHandle,
}

/// Binding client of one component.  Only the most recently sent request is outstanding,
/// responses to anything older are not matched.
#[derive(Debug)]
pub(crate) struct StunClient {
    component_id: usize,
    server: SocketAddr,
    retransmit: RetransmitConfig,
    software: Option<String>,
    outstanding: Option<Outstanding>,
    pub(crate) status: CandidateStatus,
    pub(crate) srflx_index: Option<usize>,
    /// the initial resolution timed out and is retried by the keep-alive timer
    pub(crate) retry_pending: bool,
}

impl StunClient {
    pub(crate) fn new(
        component_id: usize,
        server: SocketAddr,
        retransmit: RetransmitConfig,
        software: Option<String>,
    ) -> Self {
        Self {
            component_id,
            server,
            retransmit,
            software,
            outstanding: None,
            status: CandidateStatus::Pending,
            srflx_index: None,
            retry_pending: false,
        }
    }

    pub(crate) fn server(&self) -> SocketAddr {
        self.server
    }

    pub(crate) fn outstanding_transaction(&self) -> Option<u128> {
        self.outstanding.as_ref().map(|o| o.transaction)
    }

    fn binding_request(&self) -> Result<Message, TransportError> {
        let mut msg = Message::new_request_method(BINDING);
        if let Some(software) = &self.software {
            msg.add_attribute(Software::new(software)?.into())?;
        }
        msg.add_fingerprint()?;
        Ok(msg)
    }

    /// Send a new binding request, replacing any outstanding one.  The request is retransmitted
    /// in the background and a [`TransportEvent::StunTimeout`] is posted if nothing answers.
    pub(crate) fn send_binding(
        &mut self,
        kind: BindingKind,
        socket: Arc<UdpSocketChannel>,
        events: &async_channel::Sender<TransportEvent>,
    ) -> Result<u128, TransportError> {
        self.cancel();
        let msg = self.binding_request()?;
        let transaction = msg.transaction_id();
        let bytes = msg.to_bytes();
        let server = self.server;
        let component_id = self.component_id;
        let timeouts: Vec<Duration> = self.retransmit.timeouts().collect();
        let events = events.clone();
        debug!(
            "component {} sending {:?} binding request {:#x} to {}",
            component_id, kind, transaction, server
        );

        let (fut, abort) = futures::future::abortable(async move {
            for timeout in timeouts {
                if let Err(e) = socket.send_to(&bytes, server).await {
                    warn!("failed to send binding request to {}: {}", server, e);
                }
                Delay::new(timeout).await;
            }
            debug!("binding request {:#x} timed out", transaction);
            let _ = events.try_send(TransportEvent::StunTimeout {
                component_id,
                transaction,
            });
        });
        async_std::task::spawn(
            fut.instrument(debug_span!("stun_binding", component.id = component_id)),
        );
        self.outstanding = Some(Outstanding {
            transaction,
            kind,
            abort,
        });
        Ok(transaction)
    }

    /// Parse the response to the outstanding request.  Anything else returns `None`.
    pub(crate) fn handle_response(&mut self, data: &[u8]) -> Option<StunOutcome> {
        let msg = match Message::from_bytes(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("failed to parse STUN response: {:?}", e);
                return None;
            }
        };
        if !msg.is_response() || !msg.has_method(BINDING) {
            return None;
        }
        if self.outstanding_transaction() != Some(msg.transaction_id()) {
            trace!("ignoring response for stale transaction {:#x}", msg.transaction_id());
            return None;
        }
        let outstanding = self.outstanding.take()?;
        outstanding.abort.abort();

        let transaction = msg.transaction_id();
        let result = if msg.has_class(MessageClass::Success) {
            if let Some(raw) = msg.get_attribute(XOR_MAPPED_ADDRESS) {
                XorMappedAddress::try_from(raw).map(|attr| attr.addr(transaction))
            } else if let Some(raw) = msg.get_attribute(MAPPED_ADDRESS) {
                MappedAddress::try_from(raw).map(|attr| attr.addr())
            } else {
                Err(TransportError::NoMappedAddress)
            }
        } else {
            Err(match msg.error_code() {
                Some(err) => TransportError::StunError {
                    code: err.code(),
                    reason: err.reason().to_owned(),
                },
                None => TransportError::Malformed,
            })
        };
        debug!(
            "component {} binding {:?} result {:?}",
            self.component_id, outstanding.kind, result
        );
        Some(StunOutcome {
            kind: outstanding.kind,
            result,
        })
    }

    /// The retransmissions of `transaction` ran out.  Returns the kind of request that timed
    /// out, or `None` if it has since been replaced or answered.
    pub(crate) fn handle_timeout(&mut self, transaction: u128) -> Option<BindingKind> {
        if self.outstanding_transaction() != Some(transaction) {
            return None;
        }
        self.outstanding.take().map(|o| o.kind)
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(outstanding) = self.outstanding.take() {
            outstanding.abort.abort();
        }
    }
}

impl Drop for StunClient {
    fn drop(&mut self) {
        self.cancel();
    }
}
