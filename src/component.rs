// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::candidate::{Candidate, CandidateStatus, CandidateStore, CandidateType};
use crate::config::{ComponentOptions, TransportConfig};
use crate::router::RouteContext;
use crate::socket::{default_local_ip, host_addresses, UdpSocketChannel};
use crate::stun::client::{BindingKind, StunClient, StunOutcome};
use crate::transport::{TransportError, TransportEvent};
use crate::turn::{TurnClient, TurnState};

pub const RTP: usize = 1;
pub const RTCP: usize = 2;

/// How data leaves through a particular local candidate
#[derive(Debug, Clone)]
pub(crate) enum SendPath {
    Socket(Arc<UdpSocketChannel>),
    Relay(TurnClient),
}

impl SendPath {
    pub(crate) async fn send(&self, data: &[u8], to: SocketAddr) -> Result<(), TransportError> {
        match self {
            SendPath::Socket(socket) => Ok(socket.send_to(data, to).await?),
            SendPath::Relay(turn) => turn.send_to(data, to).await,
        }
    }
}

/// Something the application needs to hear about after a component changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ComponentUpdate {
    /// A new default candidate
    AddrChange(usize),
    /// The mapped address moved while the candidates are owned by a session
    AddressChangedInSession,
}

#[derive(Debug)]
pub(crate) struct Component {
    pub(crate) id: usize,
    socket: Arc<UdpSocketChannel>,
    base_address: SocketAddr,
    pub(crate) store: CandidateStore,
    stun: Option<StunClient>,
    // set when the STUN server could not be resolved
    stun_failure: Option<String>,
    turn: Option<TurnClient>,
    turn_status: Option<CandidateStatus>,
    relay_index: Option<usize>,
    pending: usize,
    last_error: Option<String>,
}

impl Component {
    /// Bind the socket, seed host candidates and prepare the STUN and TURN clients.  Nothing is
    /// sent until [`start`](Component::start).
    pub(crate) async fn create(
        id: usize,
        options: &ComponentOptions,
        bind_hint: SocketAddr,
        config: &TransportConfig,
        turn_generation: u64,
        events: &async_channel::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocketChannel::bind(bind_hint, options.no_port_retry).await?);
        let base_address = socket.local_addr()?;
        let mut store = CandidateStore::new(id, config.max_candidates);

        if !options.dont_add_candidate {
            if base_address.ip().is_unspecified() {
                let max = options.max_host_candidates.min(config.max_candidates);
                let ips = host_addresses(config.af, max)?;
                let default_ip = default_local_ip(config.af).await;
                for (i, ip) in ips.iter().enumerate() {
                    let addr = SocketAddr::new(*ip, base_address.port());
                    let candidate = Candidate::builder(id, CandidateType::Host, addr)
                        .local_preference(u16::MAX - i as u16)
                        .build();
                    store.add(candidate, Some(*ip) == default_ip)?;
                }
            } else {
                let candidate = Candidate::builder(id, CandidateType::Host, base_address).build();
                store.add(candidate, true)?;
            }
        }

        let mut last_error = None;
        let mut stun_failure = None;
        let stun = match &config.stun_server {
            Some(server) if !options.disable_stun => match server.resolve(config.af).await {
                Ok(addr) => Some(StunClient::new(
                    id,
                    addr,
                    config.retransmit.clone(),
                    config.software.clone(),
                )),
                Err(e) => {
                    warn!("component {} failed to resolve STUN server: {}", id, e);
                    stun_failure = Some(e.to_string());
                    last_error = Some(e.to_string());
                    None
                }
            },
            _ => None,
        };

        let mut turn_status = None;
        let turn = match &config.turn_server {
            Some(turn_config) if !options.disable_relay => match TurnClient::new(
                id,
                turn_generation,
                turn_config,
                config.af,
                config.retransmit.clone(),
                config.software.clone(),
                events.clone(),
            )
            .await
            {
                Ok(turn) => {
                    turn_status = Some(CandidateStatus::Pending);
                    Some(turn)
                }
                Err(e) => {
                    warn!("component {} failed to create TURN client: {}", id, e);
                    turn_status = Some(CandidateStatus::Failed(e.to_string()));
                    last_error = Some(e.to_string());
                    None
                }
            },
            _ => None,
        };

        Ok(Self {
            id,
            socket,
            base_address,
            store,
            stun,
            stun_failure,
            turn,
            turn_status,
            relay_index: None,
            pending: 0,
            last_error,
        })
    }

    /// Start reading from the socket and kick off STUN and TURN resolution
    pub(crate) fn start(&mut self, events: &async_channel::Sender<TransportEvent>) {
        self.socket.start_receive_loop(self.id, events.clone());
        if let Some(stun) = self.stun.as_mut() {
            match stun.send_binding(BindingKind::Resolve, self.socket.clone(), events) {
                Ok(_) => self.pending += 1,
                Err(e) => {
                    stun.status = CandidateStatus::Failed(e.to_string());
                    self.last_error = Some(e.to_string());
                }
            }
        }
        if let Some(turn) = &self.turn {
            turn.start();
            self.pending += 1;
        }
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending
    }

    pub(crate) fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub(crate) fn set_last_error(&mut self, error: String) {
        self.last_error = Some(error);
    }

    pub(crate) fn base_address(&self) -> SocketAddr {
        self.base_address
    }

    pub(crate) fn has_ready_candidate(&self) -> bool {
        self.store.iter().any(|c| c.status.is_ready())
    }

    /// Worst of every candidate and of the resolutions that haven't produced one yet
    pub(crate) fn status(&self) -> CandidateStatus {
        let mut status = self
            .store
            .worst_status()
            .unwrap_or(CandidateStatus::Ready);
        if let Some(stun) = &self.stun {
            status = status.worst(&stun.status);
        }
        if let Some(reason) = &self.stun_failure {
            status = status.worst(&CandidateStatus::Failed(reason.clone()));
        }
        if let Some(turn_status) = &self.turn_status {
            status = status.worst(turn_status);
        }
        status
    }

    pub(crate) fn is_local_address(&self, addr: SocketAddr) -> bool {
        addr == self.base_address
            || self
                .store
                .iter()
                .any(|c| c.candidate_type == CandidateType::Host && c.address == addr)
    }

    /// The candidate datagrams read from the component socket are attributed to.  Relayed
    /// candidates are never attributed: the TURN client has its own inbound path.
    pub(crate) fn attributed_candidate(&self) -> Option<usize> {
        match self.store.default_candidate() {
            Some(c) if c.candidate_type != CandidateType::Relayed => self.store.default_index(),
            _ => self
                .store
                .iter()
                .position(|c| c.candidate_type != CandidateType::Relayed),
        }
    }

    pub(crate) fn route_context(&self, session_active: bool) -> RouteContext {
        RouteContext {
            outstanding: self.stun.as_ref().and_then(|s| s.outstanding_transaction()),
            session_active,
            attributed: self
                .attributed_candidate()
                .and_then(|idx| self.store.get(idx))
                .and_then(|c| c.engine_index),
        }
    }

    /// Data arriving through the relay is attributed to the relay candidate
    pub(crate) fn relay_route_context(&self, session_active: bool) -> RouteContext {
        RouteContext {
            outstanding: None,
            session_active,
            attributed: self
                .relay_index
                .and_then(|idx| self.store.get(idx))
                .and_then(|c| c.engine_index),
        }
    }

    /// The TURN client, once its relayed candidate is usable
    pub(crate) fn ready_relay(&self) -> Option<TurnClient> {
        let relay = self.store.get(self.relay_index?)?;
        if !relay.status.is_ready() {
            return None;
        }
        self.turn.clone()
    }

    pub(crate) fn turn_generation(&self) -> Option<u64> {
        self.turn.as_ref().map(|turn| turn.generation())
    }

    pub(crate) fn send_path(&self, idx: usize) -> Result<SendPath, TransportError> {
        let candidate = self.store.get(idx).ok_or(TransportError::ResourceNotFound)?;
        match candidate.candidate_type {
            CandidateType::Relayed => self
                .turn
                .clone()
                .map(SendPath::Relay)
                .ok_or(TransportError::InvalidOperation),
            _ => self.socket_for(idx).map(SendPath::Socket),
        }
    }

    /// The plain socket for candidate `idx`.  Relayed candidates can only be used through their
    /// TURN client.
    pub(crate) fn socket_for(&self, idx: usize) -> Result<Arc<UdpSocketChannel>, TransportError> {
        let candidate = self.store.get(idx).ok_or(TransportError::ResourceNotFound)?;
        if candidate.candidate_type == CandidateType::Relayed {
            return Err(TransportError::InvalidOperation);
        }
        Ok(self.socket.clone())
    }

    pub(crate) fn default_send_path(&self) -> Result<SendPath, TransportError> {
        let idx = self
            .store
            .default_index()
            .ok_or(TransportError::ResourceNotFound)?;
        self.send_path(idx)
    }

    fn default_host_base(&self) -> SocketAddr {
        self.attributed_candidate()
            .and_then(|idx| self.store.get(idx))
            .map(|c| c.base_address)
            .unwrap_or(self.base_address)
    }

    pub(crate) fn wants_keep_alive(&self) -> bool {
        match &self.stun {
            Some(stun) => {
                stun.retry_pending
                    || stun
                        .srflx_index
                        .and_then(|idx| self.store.get(idx))
                        .map_or(false, |c| c.status.is_ready())
            }
            None => false,
        }
    }

    pub(crate) fn send_keep_alive(
        &mut self,
        events: &async_channel::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let socket = self.socket.clone();
        match self.stun.as_mut() {
            Some(stun) => stun
                .send_binding(BindingKind::KeepAlive, socket, events)
                .map(|_| ()),
            None => Err(TransportError::InvalidOperation),
        }
    }

    pub(crate) fn on_stun_datagram(
        &mut self,
        data: &[u8],
        session_active: bool,
    ) -> Option<ComponentUpdate> {
        let outcome = self.stun.as_mut()?.handle_response(data)?;
        self.on_stun_outcome(outcome, session_active)
    }

    fn on_stun_outcome(
        &mut self,
        outcome: StunOutcome,
        session_active: bool,
    ) -> Option<ComponentUpdate> {
        if outcome.kind == BindingKind::Resolve {
            self.pending = self.pending.saturating_sub(1);
        }
        let srflx_index = self.stun.as_ref()?.srflx_index;

        let mapped = match outcome.result {
            Ok(mapped) => mapped,
            Err(e) => {
                let reason = e.to_string();
                match outcome.kind {
                    BindingKind::Resolve => {
                        warn!("component {} STUN resolution failed: {}", self.id, reason);
                        if let Some(stun) = self.stun.as_mut() {
                            stun.status = CandidateStatus::Failed(reason.clone());
                            stun.retry_pending = false;
                        }
                    }
                    // the binding stays in use and is checked again at the next fire
                    BindingKind::KeepAlive => {
                        warn!("component {} keep-alive failed: {}", self.id, reason)
                    }
                }
                self.last_error = Some(reason);
                return None;
            }
        };

        if let Some(stun) = self.stun.as_mut() {
            stun.status = CandidateStatus::Ready;
            stun.retry_pending = false;
        }
        if self.is_local_address(mapped) {
            debug!(
                "component {} mapped address {} is local, not adding a candidate",
                self.id, mapped
            );
            return None;
        }
        if let Some(candidate) = srflx_index.and_then(|idx| self.store.get_mut(idx)) {
            if candidate.address == mapped {
                candidate.status = CandidateStatus::Ready;
                return None;
            }
            info!(
                "component {} mapped address changed {} -> {}",
                self.id, candidate.address, mapped
            );
        }
        if session_active {
            return Some(ComponentUpdate::AddressChangedInSession);
        }

        let base = self.default_host_base();
        let candidate = Candidate::builder(self.id, CandidateType::ServerReflexive, mapped)
            .base_address(base)
            .related_address(base)
            .build();
        let added = self
            .store
            .add(candidate, true)
            .and_then(|idx| self.store.set_default(idx).map(|_| idx));
        match added {
            Ok(idx) => {
                // the address may be one we were mapped to before
                if let Some(candidate) = self.store.get_mut(idx) {
                    candidate.status = CandidateStatus::Ready;
                }
                if let Some(old) = srflx_index.filter(|old| *old != idx) {
                    if let Some(candidate) = self.store.get_mut(old) {
                        candidate.status = CandidateStatus::superseded();
                    }
                }
                if let Some(stun) = self.stun.as_mut() {
                    stun.srflx_index = Some(idx);
                }
                Some(ComponentUpdate::AddrChange(idx))
            }
            Err(e) => {
                if let Some(stun) = self.stun.as_mut() {
                    stun.status = CandidateStatus::Failed(e.to_string());
                }
                self.last_error = Some(e.to_string());
                None
            }
        }
    }

    /// Retransmissions of `transaction` ran out.  A timed out resolution stays pending and is
    /// retried by the keep-alive timer.
    pub(crate) fn on_stun_timeout(&mut self, transaction: u128) {
        let stun = match self.stun.as_mut() {
            Some(stun) => stun,
            None => return,
        };
        match stun.handle_timeout(transaction) {
            Some(BindingKind::Resolve) => {
                info!(
                    "component {} STUN resolution timed out, retrying with the keep-alive",
                    self.id
                );
                self.pending = self.pending.saturating_sub(1);
                stun.retry_pending = true;
            }
            Some(BindingKind::KeepAlive) => {
                debug!("component {} keep-alive timed out", self.id);
            }
            None => (),
        }
    }

    pub(crate) fn on_turn_state(
        &mut self,
        generation: u64,
        state: TurnState,
    ) -> Option<ComponentUpdate> {
        if self.turn_generation() != Some(generation) {
            trace!("ignoring state {:?} of a detached TURN client", state);
            return None;
        }
        match state {
            TurnState::Ready if self.relay_index.is_none() => {
                self.pending = self.pending.saturating_sub(1);
                let allocation = self.turn.as_ref()?.allocation()?;
                let mut builder =
                    Candidate::builder(self.id, CandidateType::Relayed, allocation.relayed)
                        .base_address(allocation.relayed);
                if let Some(mapped) = allocation.mapped {
                    builder = builder.related_address(mapped);
                }
                let added = self
                    .store
                    .add(builder.build(), true)
                    .and_then(|idx| self.store.set_default(idx).map(|_| idx));
                match added {
                    Ok(idx) => {
                        self.relay_index = Some(idx);
                        self.turn_status = Some(CandidateStatus::Ready);
                        Some(ComponentUpdate::AddrChange(idx))
                    }
                    Err(e) => {
                        self.turn_status = Some(CandidateStatus::Failed(e.to_string()));
                        self.last_error = Some(e.to_string());
                        None
                    }
                }
            }
            TurnState::Deallocating | TurnState::Closed => {
                let turn = self.turn.take()?;
                turn.detach();
                let reason = turn
                    .last_error()
                    .unwrap_or_else(|| "relay allocation closed".to_owned());
                match self.relay_index {
                    None => self.pending = self.pending.saturating_sub(1),
                    Some(idx) => {
                        if let Some(candidate) = self.store.get_mut(idx) {
                            candidate.status = CandidateStatus::Failed(reason.clone());
                        }
                        if self.store.default_index() == Some(idx) {
                            if let Some(other) = self.attributed_candidate() {
                                let _ = self.store.set_default(other);
                            }
                        }
                    }
                }
                self.turn_status = Some(CandidateStatus::Failed(reason.clone()));
                self.last_error = Some(reason);
                None
            }
            _ => None,
        }
    }

    /// Stop all I/O.  The TURN client, if any, is handed back so its allocation can be
    /// released.
    pub(crate) fn close(&mut self) -> Option<TurnClient> {
        self.socket.close();
        if let Some(stun) = self.stun.as_mut() {
            stun.cancel();
        }
        let turn = self.turn.take();
        if let Some(turn) = &turn {
            turn.detach();
        }
        turn
    }
}

impl Drop for Component {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerAddress;
    use crate::stun::attribute::{ErrorCode, XorMappedAddress};
    use crate::stun::message::{Message, MessageClass, MessageType, BINDING};
    use async_std::task;

    fn init() {
        crate::tests::test_init_log();
    }

    async fn component(
        config: &TransportConfig,
    ) -> (Component, async_channel::Receiver<TransportEvent>) {
        let (send, recv) = async_channel::unbounded();
        let component = Component::create(
            RTP,
            &ComponentOptions::default(),
            "127.0.0.1:0".parse().unwrap(),
            config,
            1,
            &send,
        )
        .await
        .unwrap();
        (component, recv)
    }

    async fn with_stun() -> (
        Component,
        async_channel::Sender<TransportEvent>,
        async_channel::Receiver<TransportEvent>,
    ) {
        // nothing answers, responses are injected directly
        let server = async_std::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = TransportConfig::builder()
            .stun_server(ServerAddress::from(server.local_addr().unwrap()))
            .retransmit(std::time::Duration::from_secs(5), 1)
            .build();
        let (send, recv) = async_channel::unbounded();
        let mut component = Component::create(
            RTP,
            &ComponentOptions::default(),
            "127.0.0.1:0".parse().unwrap(),
            &config,
            1,
            &send,
        )
        .await
        .unwrap();
        component.start(&send);
        (component, send, recv)
    }

    // the request currently outstanding at the STUN server
    fn outstanding_request(component: &Component) -> Message {
        let transaction = component.route_context(false).outstanding.unwrap();
        Message::new(
            MessageType::from_class_method(MessageClass::Request, BINDING),
            transaction,
        )
    }

    fn response_for(component: &Component, mapped: SocketAddr) -> Vec<u8> {
        let request = outstanding_request(component);
        let mut response = Message::new_success(&request);
        response
            .add_attribute(XorMappedAddress::new(mapped, request.transaction_id()).into())
            .unwrap();
        response.to_bytes()
    }

    fn error_response_for(component: &Component, code: u16, reason: &str) -> Vec<u8> {
        let mut response = Message::new_error(&outstanding_request(component));
        response
            .add_attribute(ErrorCode::new(code, reason).unwrap().into())
            .unwrap();
        response.to_bytes()
    }

    #[test]
    fn concrete_bind_single_host_candidate() {
        init();
        task::block_on(async move {
            let (component, _recv) = component(&TransportConfig::default()).await;
            assert_eq!(component.store.len(), 1);
            let host = component.store.default_candidate().unwrap();
            assert_eq!(host.candidate_type, CandidateType::Host);
            assert_eq!(host.address, component.base_address());
            assert_eq!(host.status, CandidateStatus::Ready);
            assert_eq!(component.pending(), 0);
            assert_eq!(component.status(), CandidateStatus::Ready);
        })
    }

    #[test]
    fn dont_add_candidate() {
        init();
        task::block_on(async move {
            let (send, _recv) = async_channel::unbounded();
            let options = ComponentOptions {
                dont_add_candidate: true,
                ..Default::default()
            };
            let component = Component::create(
                RTP,
                &options,
                "127.0.0.1:0".parse().unwrap(),
                &TransportConfig::default(),
                1,
                &send,
            )
            .await
            .unwrap();
            assert!(component.store.is_empty());
            assert!(!component.has_ready_candidate());
        })
    }

    #[test]
    fn local_mapped_address_is_discarded() {
        init();
        task::block_on(async move {
            let (mut component, _send, _recv) = with_stun().await;
            assert_eq!(component.pending(), 1);
            assert_eq!(component.status(), CandidateStatus::Pending);
            let data = response_for(&component, component.base_address());
            assert!(component.on_stun_datagram(&data, false).is_none());
            assert_eq!(component.store.len(), 1);
            assert_eq!(component.pending(), 0);
            assert_eq!(component.status(), CandidateStatus::Ready);
            assert!(!component.wants_keep_alive());
        })
    }

    #[test]
    fn mapped_address_adds_default_srflx() {
        init();
        task::block_on(async move {
            let (mut component, send, _recv) = with_stun().await;
            let mapped: SocketAddr = "198.51.100.7:40000".parse().unwrap();
            let data = response_for(&component, mapped);
            assert_eq!(
                component.on_stun_datagram(&data, false),
                Some(ComponentUpdate::AddrChange(1))
            );
            // duplicate delivery of the same response changes nothing
            assert!(component.on_stun_datagram(&data, false).is_none());
            let srflx = component.store.default_candidate().unwrap();
            assert_eq!(srflx.candidate_type, CandidateType::ServerReflexive);
            assert_eq!(srflx.address, mapped);
            assert_eq!(srflx.base_address, component.base_address());
            assert_eq!(srflx.related_address, Some(component.base_address()));
            assert!(component.wants_keep_alive());
            // datagrams from the socket are still attributed to the host candidate
            assert_eq!(component.attributed_candidate(), Some(0));

            // same address from a keep-alive only refreshes
            component.send_keep_alive(&send).unwrap();
            let data = response_for(&component, mapped);
            assert!(component.on_stun_datagram(&data, false).is_none());
            assert_eq!(component.store.len(), 2);

            // a new address during a session is only reported
            component.send_keep_alive(&send).unwrap();
            let data = response_for(&component, "198.51.100.7:40002".parse().unwrap());
            assert_eq!(
                component.on_stun_datagram(&data, true),
                Some(ComponentUpdate::AddressChangedInSession)
            );
            assert_eq!(component.store.len(), 2);
        })
    }

    #[test]
    fn error_response_fails_only_the_slot() {
        init();
        task::block_on(async move {
            let (mut component, _send, _recv) = with_stun().await;
            let data = error_response_for(&component, 500, "Server Error");
            assert!(component.on_stun_datagram(&data, false).is_none());
            assert!(matches!(component.status(), CandidateStatus::Failed(_)));
            assert!(component.last_error().is_some());
            // the host candidate is untouched
            assert_eq!(
                component.store.get(0).unwrap().status,
                CandidateStatus::Ready
            );
            assert!(component.has_ready_candidate());
        })
    }

    #[test]
    fn keep_alive_error_keeps_the_binding() {
        init();
        task::block_on(async move {
            let (mut component, send, _recv) = with_stun().await;
            let mapped: SocketAddr = "198.51.100.7:40000".parse().unwrap();
            let data = response_for(&component, mapped);
            assert!(component.on_stun_datagram(&data, false).is_some());
            assert!(component.wants_keep_alive());

            component.send_keep_alive(&send).unwrap();
            let data = error_response_for(&component, 500, "Server Error");
            assert!(component.on_stun_datagram(&data, false).is_none());
            let srflx = component.store.default_candidate().unwrap();
            assert_eq!(srflx.address, mapped);
            assert_eq!(srflx.status, CandidateStatus::Ready);
            assert!(component.last_error().is_some());
            assert_eq!(component.status(), CandidateStatus::Ready);
            assert!(component.wants_keep_alive());

            // the next keep-alive goes out and refreshes the same binding
            component.send_keep_alive(&send).unwrap();
            let data = response_for(&component, mapped);
            assert!(component.on_stun_datagram(&data, false).is_none());
            assert_eq!(component.store.len(), 2);
        })
    }

    #[test]
    fn retried_resolution_survives_an_error() {
        init();
        task::block_on(async move {
            let (mut component, send, _recv) = with_stun().await;
            let transaction = component.route_context(false).outstanding.unwrap();
            component.on_stun_timeout(transaction);
            assert!(component.wants_keep_alive());

            component.send_keep_alive(&send).unwrap();
            let data = error_response_for(&component, 503, "Busy");
            assert!(component.on_stun_datagram(&data, false).is_none());
            assert!(component.wants_keep_alive());
            assert_eq!(component.status(), CandidateStatus::Pending);

            component.send_keep_alive(&send).unwrap();
            let data = response_for(&component, "198.51.100.9:40000".parse().unwrap());
            assert_eq!(
                component.on_stun_datagram(&data, false),
                Some(ComponentUpdate::AddrChange(1))
            );
            assert_eq!(component.status(), CandidateStatus::Ready);
        })
    }

    #[test]
    fn rebinding_supersedes_the_old_srflx() {
        init();
        task::block_on(async move {
            let (mut component, send, _recv) = with_stun().await;
            let first: SocketAddr = "198.51.100.7:40000".parse().unwrap();
            let second: SocketAddr = "198.51.100.8:40001".parse().unwrap();
            let data = response_for(&component, first);
            assert_eq!(
                component.on_stun_datagram(&data, false),
                Some(ComponentUpdate::AddrChange(1))
            );

            component.send_keep_alive(&send).unwrap();
            let data = response_for(&component, second);
            assert_eq!(
                component.on_stun_datagram(&data, false),
                Some(ComponentUpdate::AddrChange(2))
            );
            assert!(component.store.get(1).unwrap().status.is_superseded());
            assert_eq!(component.store.get(2).unwrap().status, CandidateStatus::Ready);
            assert_eq!(component.store.default_index(), Some(2));
            assert_eq!(component.status(), CandidateStatus::Ready);

            // moving back reuses the earlier candidate
            component.send_keep_alive(&send).unwrap();
            let data = response_for(&component, first);
            assert_eq!(
                component.on_stun_datagram(&data, false),
                Some(ComponentUpdate::AddrChange(1))
            );
            assert_eq!(component.store.len(), 3);
            assert_eq!(component.store.get(1).unwrap().status, CandidateStatus::Ready);
            assert!(component.store.get(2).unwrap().status.is_superseded());
            assert_eq!(component.store.default_index(), Some(1));
        })
    }

    #[test]
    fn timeout_waits_for_keep_alive() {
        init();
        task::block_on(async move {
            let (mut component, _send, _recv) = with_stun().await;
            let transaction = component.route_context(false).outstanding.unwrap();
            component.on_stun_timeout(transaction.wrapping_add(1));
            assert_eq!(component.pending(), 1);
            component.on_stun_timeout(transaction);
            assert_eq!(component.pending(), 0);
            assert_eq!(component.status(), CandidateStatus::Pending);
            assert!(component.wants_keep_alive());
            assert!(component.last_error().is_none());
        })
    }

    #[test]
    fn relayed_candidate_needs_the_turn_client() {
        init();
        task::block_on(async move {
            let (mut component, _recv) = component(&TransportConfig::default()).await;
            let idx = component
                .store
                .add(
                    Candidate::builder(
                        RTP,
                        CandidateType::Relayed,
                        "203.0.113.1:5000".parse().unwrap(),
                    )
                    .build(),
                    false,
                )
                .unwrap();
            assert!(matches!(
                component.socket_for(idx),
                Err(TransportError::InvalidOperation)
            ));
            assert!(matches!(
                component.send_path(idx),
                Err(TransportError::InvalidOperation)
            ));
            assert!(component.socket_for(0).is_ok());
            assert!(matches!(
                component.socket_for(5),
                Err(TransportError::ResourceNotFound)
            ));
        })
    }
}
