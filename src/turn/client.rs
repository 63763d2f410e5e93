// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_std::net::UdpSocket;
use futures::future::{AbortHandle, Either};
use futures_timer::Delay;
use tracing_futures::Instrument;

use crate::config::{AddressFamily, RetransmitConfig, TurnServerConfig};
use crate::socket::wildcard_address;
use crate::stun::attribute::*;
use crate::stun::message::*;
use crate::transport::{TransportError, TransportEvent};
use crate::turn::attribute::{
    self, Data, Lifetime, RequestedTransport, XorPeerAddress, XorRelayedAddress, LIFETIME,
    TRANSPORT_UDP, XOR_PEER_ADDRESS, XOR_RELAYED_ADDRESS,
};
use crate::turn::{method_name, ALLOCATE, CREATE_PERMISSION, DATA, REFRESH, SEND};

const MAX_ALLOCATE_ATTEMPTS: usize = 3;
const RECV_BUFFER_SIZE: usize = 2000;
const MAX_READ_RETRY: usize = 8;
// permissions last 300 seconds on the server, renew them a minute early
const PERMISSION_REFRESH: Duration = Duration::from_secs(240);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TurnState {
    Init,
    Allocating,
    Ready,
    Refreshing,
    Deallocating,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    StateChanged { old: TurnState, new: TurnState },
    /// Data relayed from `peer`
    Data { data: Vec<u8>, peer: SocketAddr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub relayed: SocketAddr,
    /// Our address as seen by the TURN server
    pub mapped: Option<SocketAddr>,
    pub lifetime: Duration,
}

#[derive(Debug, Clone)]
struct Auth {
    realm: String,
    nonce: String,
}

#[derive(Debug)]
struct TurnClientState {
    state: TurnState,
    auth: Option<Auth>,
    allocation: Option<Allocation>,
    /// peer address -> when its permission has to be created again
    permissions: HashMap<IpAddr, Instant>,
    outstanding: HashMap<u128, async_channel::Sender<Message>>,
    detached: bool,
    last_error: Option<String>,
    receive_loop: Option<AbortHandle>,
    runner: Option<AbortHandle>,
}

#[derive(Debug)]
struct TurnClientInner {
    component_id: usize,
    generation: u64,
    socket: Arc<UdpSocket>,
    server: SocketAddr,
    config: TurnServerConfig,
    retransmit: RetransmitConfig,
    software: Option<String>,
    events: async_channel::Sender<TransportEvent>,
    state: Mutex<TurnClientState>,
}

impl Drop for TurnClientInner {
    fn drop(&mut self) {
        if let Ok(state) = self.state.get_mut() {
            if let Some(abort) = state.runner.take() {
                abort.abort();
            }
            if let Some(abort) = state.receive_loop.take() {
                abort.abort();
            }
        }
    }
}

/// Relay allocation of one component.  Owns its own socket and locking so
/// [`send_to`](TurnClient::send_to) can be used from any task.
#[derive(Debug, Clone)]
pub struct TurnClient {
    inner: Arc<TurnClientInner>,
}

fn refresh_delay(lifetime: Duration) -> Duration {
    if lifetime > Duration::from_secs(120) {
        lifetime - Duration::from_secs(60)
    } else {
        lifetime / 2
    }
}

fn error_from_response(response: &Message) -> TransportError {
    match response.error_code() {
        Some(err) => TransportError::StunError {
            code: err.code(),
            reason: err.reason().to_owned(),
        },
        None => TransportError::Malformed,
    }
}

impl TurnClient {
    pub(crate) async fn new(
        component_id: usize,
        generation: u64,
        config: &TurnServerConfig,
        af: AddressFamily,
        retransmit: RetransmitConfig,
        software: Option<String>,
        events: async_channel::Sender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        let server = config.server.resolve(af).await?;
        let socket = UdpSocket::bind(wildcard_address(af)).await?;
        debug!(
            "component {} TURN client bound to {:?} for server {}",
            component_id,
            socket.local_addr(),
            server
        );
        Ok(Self {
            inner: Arc::new(TurnClientInner {
                component_id,
                generation,
                socket: Arc::new(socket),
                server,
                config: config.clone(),
                retransmit,
                software,
                events,
                state: Mutex::new(TurnClientState {
                    state: TurnState::Init,
                    auth: None,
                    allocation: None,
                    permissions: HashMap::new(),
                    outstanding: HashMap::new(),
                    detached: false,
                    last_error: None,
                    receive_loop: None,
                    runner: None,
                }),
            }),
        })
    }

    fn upgrade(weak: &Weak<TurnClientInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn state(&self) -> TurnState {
        self.inner.state.lock().unwrap().state
    }

    pub fn allocation(&self) -> Option<Allocation> {
        self.inner.state.lock().unwrap().allocation
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().unwrap().last_error.clone()
    }

    pub fn server(&self) -> SocketAddr {
        self.inner.server
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.inner.socket.local_addr()?)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Start receiving from the server and allocating.  Only has an effect in `Init`.
    pub(crate) fn start(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if state.state != TurnState::Init || state.runner.is_some() {
            return;
        }
        let span = debug_span!("turn", component.id = self.inner.component_id);

        let (fut, abort) = futures::future::abortable(TurnClient::receive_loop(
            Arc::downgrade(&self.inner),
            self.inner.socket.clone(),
            self.inner.server,
        ));
        async_std::task::spawn(fut.instrument(span.clone()));
        state.receive_loop = Some(abort);

        let (fut, abort) =
            futures::future::abortable(TurnClient::run(Arc::downgrade(&self.inner)));
        async_std::task::spawn(fut.instrument(span));
        state.runner = Some(abort);
    }

    /// Stop reporting events to the transport.  Used once the transport no longer cares about
    /// this allocation.
    pub(crate) fn detach(&self) {
        self.inner.state.lock().unwrap().detached = true;
    }

    fn post(&self, event: TurnEvent) {
        if self.inner.state.lock().unwrap().detached {
            trace!("detached, dropping {:?}", event);
            return;
        }
        let _ = self.inner.events.try_send(TransportEvent::Turn {
            component_id: self.inner.component_id,
            generation: self.inner.generation,
            event,
        });
    }

    fn set_state(&self, new: TurnState) {
        let old = {
            let mut state = self.inner.state.lock().unwrap();
            let old = state.state;
            if old == new {
                return;
            }
            state.state = new;
            old
        };
        info!(
            "component {} TURN state {:?} -> {:?}",
            self.inner.component_id, old, new
        );
        self.post(TurnEvent::StateChanged { old, new });
    }

    async fn receive_loop(
        weak: Weak<TurnClientInner>,
        socket: Arc<UdpSocket>,
        server: SocketAddr,
    ) {
        let mut errors = 0;
        loop {
            let mut data = vec![0; RECV_BUFFER_SIZE];
            let (len, from) = match socket.recv_from(&mut data).await {
                Ok(ret) => {
                    errors = 0;
                    ret
                }
                Err(e) => {
                    errors += 1;
                    warn!("TURN socket read error {} ({}/{})", e, errors, MAX_READ_RETRY);
                    if errors >= MAX_READ_RETRY {
                        break;
                    }
                    continue;
                }
            };
            if from != server {
                trace!("ignoring {} bytes from {} which is not the server", len, from);
                continue;
            }
            match TurnClient::upgrade(&weak) {
                Some(client) => client.handle_incoming(&data[..len]),
                None => break,
            }
        }
    }

    fn handle_incoming(&self, data: &[u8]) {
        if !is_stun_message(data) {
            trace!("ignoring non-STUN data from the TURN server");
            return;
        }
        let msg = match Message::from_bytes(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("failed to parse message from TURN server: {:?}", e);
                return;
            }
        };
        if msg.is_response() {
            let sender = self
                .inner
                .state
                .lock()
                .unwrap()
                .outstanding
                .get(&msg.transaction_id())
                .cloned();
            match sender {
                Some(sender) => {
                    let _ = sender.try_send(msg);
                }
                None => trace!("no outstanding request {:#x}", msg.transaction_id()),
            }
            return;
        }
        if msg.has_class(MessageClass::Indication) && msg.has_method(DATA) {
            let transaction = msg.transaction_id();
            let peer = msg
                .get_attribute(XOR_PEER_ADDRESS)
                .and_then(|raw| XorPeerAddress::try_from(raw).ok())
                .map(|attr| attr.addr(transaction));
            let data = msg
                .get_attribute(attribute::DATA)
                .and_then(|raw| Data::try_from(raw).ok());
            match (peer, data) {
                (Some(peer), Some(data)) => self.post(TurnEvent::Data {
                    data: data.into_data(),
                    peer,
                }),
                _ => debug!("malformed DATA indication {}", msg),
            }
        }
    }

    /// Send `msg` retransmitting until a response with the same transaction arrives
    async fn request(&self, msg: Message) -> Result<Message, TransportError> {
        let transaction = msg.transaction_id();
        let bytes = msg.to_bytes();
        let (send, recv) = async_channel::bounded(1);
        self.inner
            .state
            .lock()
            .unwrap()
            .outstanding
            .insert(transaction, send);

        let timeouts: Vec<Duration> = self.inner.retransmit.timeouts().collect();
        let mut ret = Err(TransportError::TimedOut);
        for timeout in timeouts {
            debug!(
                "sending {} request {:#x} to {}",
                method_name(msg.method()),
                transaction,
                self.inner.server
            );
            if let Err(e) = self.inner.socket.send_to(&bytes, self.inner.server).await {
                warn!("failed to send to TURN server: {}", e);
            }
            let response = recv.recv();
            let delay = Delay::new(timeout);
            futures::pin_mut!(response);
            match futures::future::select(response, delay).await {
                Either::Left((Ok(response), _)) => {
                    ret = Ok(response);
                    break;
                }
                Either::Left((Err(_), _)) => {
                    ret = Err(TransportError::ConnectionClosed);
                    break;
                }
                Either::Right(_) => (),
            }
        }
        self.inner
            .state
            .lock()
            .unwrap()
            .outstanding
            .remove(&transaction);
        ret
    }

    fn current_auth(&self) -> Option<Auth> {
        self.inner.state.lock().unwrap().auth.clone()
    }

    fn authenticate(&self, msg: &mut Message, auth: Option<&Auth>) -> Result<(), TransportError> {
        if let Some(software) = &self.inner.software {
            msg.add_attribute(Software::new(software)?.into())?;
        }
        if let Some(auth) = auth {
            let credentials = &self.inner.config.credentials;
            msg.add_attribute(Username::new(&credentials.username)?.into())?;
            msg.add_attribute(Realm::new(&auth.realm)?.into())?;
            msg.add_attribute(Nonce::new(&auth.nonce)?.into())?;
            msg.add_message_integrity(&MessageIntegrityCredentials::LongTerm(
                LongTermCredentials {
                    username: credentials.username.clone(),
                    realm: auth.realm.clone(),
                    password: credentials.password.clone(),
                },
            ))?;
        }
        msg.add_fingerprint()
    }

    // Picks up REALM and NONCE from a 401 or 438 response.  Returns whether a retry with the
    // new values makes sense.
    fn update_auth(&self, response: &Message) -> bool {
        let code = match response.error_code() {
            Some(err) => err.code(),
            None => return false,
        };
        if code != UNAUTHORIZED && code != STALE_NONCE {
            return false;
        }
        let mut state = self.inner.state.lock().unwrap();
        let realm = response
            .get_attribute(REALM)
            .and_then(|raw| Realm::try_from(raw).ok())
            .map(|realm| realm.realm().to_owned())
            .or_else(|| state.auth.as_ref().map(|auth| auth.realm.clone()));
        let nonce = response
            .get_attribute(NONCE)
            .and_then(|raw| Nonce::try_from(raw).ok())
            .map(|nonce| nonce.nonce().to_owned());
        match (realm, nonce) {
            (Some(realm), Some(nonce)) => {
                debug!("{} with realm '{}' nonce '{}'", code, realm, nonce);
                state.auth = Some(Auth { realm, nonce });
                true
            }
            _ => false,
        }
    }

    fn parse_allocation(&self, response: &Message) -> Result<Allocation, TransportError> {
        let transaction = response.transaction_id();
        let relayed = response
            .get_attribute(XOR_RELAYED_ADDRESS)
            .ok_or(TransportError::NoMappedAddress)?;
        let relayed = XorRelayedAddress::try_from(relayed)?.addr(transaction);
        let mapped = response
            .get_attribute(XOR_MAPPED_ADDRESS)
            .and_then(|raw| XorMappedAddress::try_from(raw).ok())
            .map(|attr| attr.addr(transaction));
        let lifetime = response
            .get_attribute(LIFETIME)
            .and_then(|raw| Lifetime::try_from(raw).ok())
            .map(|lifetime| lifetime.lifetime())
            .unwrap_or(self.inner.config.alloc_params.lifetime);
        Ok(Allocation {
            relayed,
            mapped,
            lifetime,
        })
    }

    async fn allocate(&self) -> Result<Allocation, TransportError> {
        let mut last_err = TransportError::TimedOut;
        for attempt in 0..MAX_ALLOCATE_ATTEMPTS {
            let mut msg = Message::new_request_method(ALLOCATE);
            msg.add_attribute(RequestedTransport::new(TRANSPORT_UDP).into())?;
            msg.add_attribute(Lifetime::new(self.inner.config.alloc_params.lifetime).into())?;
            let auth = self.current_auth();
            self.authenticate(&mut msg, auth.as_ref())?;
            trace!("allocate attempt {}", attempt + 1);

            let response = self.request(msg).await?;
            if response.has_class(MessageClass::Success) {
                return self.parse_allocation(&response);
            }
            last_err = error_from_response(&response);
            if !self.update_auth(&response) {
                break;
            }
        }
        Err(last_err)
    }

    async fn refresh(&self, lifetime: Duration) -> Result<Duration, TransportError> {
        let mut last_err = TransportError::TimedOut;
        // one retry for a stale nonce
        for _ in 0..2 {
            let mut msg = Message::new_request_method(REFRESH);
            msg.add_attribute(Lifetime::new(lifetime).into())?;
            let auth = self.current_auth();
            self.authenticate(&mut msg, auth.as_ref())?;
            let response = self.request(msg).await?;
            if response.has_class(MessageClass::Success) {
                return Ok(response
                    .get_attribute(LIFETIME)
                    .and_then(|raw| Lifetime::try_from(raw).ok())
                    .map(|lifetime| lifetime.lifetime())
                    .unwrap_or(lifetime));
            }
            last_err = error_from_response(&response);
            let stale = response.error_code().map(|err| err.code()) == Some(STALE_NONCE);
            if !stale || !self.update_auth(&response) {
                break;
            }
        }
        Err(last_err)
    }

    async fn create_permission(&self, peer: SocketAddr) -> Result<(), TransportError> {
        let mut last_err = TransportError::TimedOut;
        for _ in 0..2 {
            let mut msg = Message::new_request_method(CREATE_PERMISSION);
            msg.add_attribute(XorPeerAddress::new(peer, msg.transaction_id()).into())?;
            let auth = self.current_auth();
            self.authenticate(&mut msg, auth.as_ref())?;
            let response = self.request(msg).await?;
            if response.has_class(MessageClass::Success) {
                debug!("installed permission for {}", peer.ip());
                self.inner
                    .state
                    .lock()
                    .unwrap()
                    .permissions
                    .insert(peer.ip(), Instant::now() + PERMISSION_REFRESH);
                return Ok(());
            }
            last_err = error_from_response(&response);
            let stale = response.error_code().map(|err| err.code()) == Some(STALE_NONCE);
            if !stale || !self.update_auth(&response) {
                break;
            }
        }
        Err(last_err)
    }

    fn fail(&self, error: TransportError) {
        warn!(
            "component {} TURN allocation failed: {}",
            self.inner.component_id, error
        );
        self.inner.state.lock().unwrap().last_error = Some(error.to_string());
        self.set_state(TurnState::Deallocating);
        self.set_state(TurnState::Closed);
        if let Some(abort) = self.inner.state.lock().unwrap().receive_loop.take() {
            abort.abort();
        }
    }

    async fn run(weak: Weak<TurnClientInner>) {
        let mut lifetime = {
            let client = match TurnClient::upgrade(&weak) {
                Some(client) => client,
                None => return,
            };
            client.set_state(TurnState::Allocating);
            match client.allocate().await {
                Ok(allocation) => {
                    info!(
                        "allocated relay {} (mapped {:?}) for {:?}",
                        allocation.relayed, allocation.mapped, allocation.lifetime
                    );
                    client.inner.state.lock().unwrap().allocation = Some(allocation);
                    client.set_state(TurnState::Ready);
                    allocation.lifetime
                }
                Err(e) => {
                    client.fail(e);
                    return;
                }
            }
        };

        loop {
            Delay::new(refresh_delay(lifetime)).await;
            let client = match TurnClient::upgrade(&weak) {
                Some(client) => client,
                None => return,
            };
            client.set_state(TurnState::Refreshing);
            match client
                .refresh(client.inner.config.alloc_params.lifetime)
                .await
            {
                Ok(new_lifetime) => {
                    lifetime = new_lifetime;
                    if let Some(allocation) =
                        client.inner.state.lock().unwrap().allocation.as_mut()
                    {
                        allocation.lifetime = new_lifetime;
                    }
                    client.set_state(TurnState::Ready);
                }
                Err(e) => {
                    client.fail(e);
                    return;
                }
            }
        }
    }

    fn is_usable(state: &TurnClientState) -> bool {
        matches!(state.state, TurnState::Ready | TurnState::Refreshing)
    }

    fn needs_permission(state: &TurnClientState, peer: IpAddr) -> bool {
        state
            .permissions
            .get(&peer)
            .map_or(true, |renew_at| Instant::now() >= *renew_at)
    }

    /// Create permissions for every distinct IP address of `peers` that has none, or one
    /// about to expire.  Failures are logged.
    pub(crate) async fn install_permissions(&self, peers: &[SocketAddr]) {
        let mut done: Vec<IpAddr> = vec![];
        for peer in peers {
            if done.contains(&peer.ip()) {
                continue;
            }
            done.push(peer.ip());
            {
                let state = self.inner.state.lock().unwrap();
                if !TurnClient::is_usable(&state) {
                    debug!("allocation not usable, not installing permissions");
                    return;
                }
                if !TurnClient::needs_permission(&state, peer.ip()) {
                    continue;
                }
            }
            if let Err(e) = self.create_permission(*peer).await {
                warn!("failed to create permission for {}: {}", peer.ip(), e);
            }
        }
    }

    /// Send `data` to `peer` through the relay.  A permission for the peer's IP address is
    /// created first if there is none or it is about to expire.
    pub async fn send_to(&self, data: &[u8], peer: SocketAddr) -> Result<(), TransportError> {
        let need_permission = {
            let state = self.inner.state.lock().unwrap();
            if !TurnClient::is_usable(&state) {
                return Err(TransportError::InvalidOperation);
            }
            TurnClient::needs_permission(&state, peer.ip())
        };
        if need_permission {
            self.create_permission(peer).await?;
        }

        let mut msg = Message::new_indication_method(SEND);
        msg.add_attribute(XorPeerAddress::new(peer, msg.transaction_id()).into())?;
        msg.add_attribute(Data::new(data)?.into())?;
        msg.add_fingerprint()?;
        trace!("relaying {} bytes to {}", data.len(), peer);
        self.inner
            .socket
            .send_to(&msg.to_bytes(), self.inner.server)
            .await?;
        Ok(())
    }

    /// Release the allocation (a REFRESH with a zero lifetime) and stop.
    pub async fn close(&self) {
        let (runner, release, auth) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.state == TurnState::Closed {
                return;
            }
            (
                state.runner.take(),
                state.allocation.is_some() && state.state < TurnState::Deallocating,
                state.auth.clone(),
            )
        };
        if let Some(abort) = runner {
            abort.abort();
        }
        self.set_state(TurnState::Deallocating);
        if release {
            let mut msg = Message::new_request_method(REFRESH);
            let built = msg
                .add_attribute(Lifetime::new(Duration::ZERO).into())
                .and_then(|_| self.authenticate(&mut msg, auth.as_ref()));
            match built {
                Ok(_) => {
                    if let Err(e) = self
                        .inner
                        .socket
                        .send_to(&msg.to_bytes(), self.inner.server)
                        .await
                    {
                        debug!("failed to send deallocation: {}", e);
                    }
                }
                Err(e) => debug!("failed to build deallocation: {:?}", e),
            }
        }
        self.set_state(TurnState::Closed);
        if let Some(abort) = self.inner.state.lock().unwrap().receive_loop.take() {
            abort.abort();
        }
    }
}
