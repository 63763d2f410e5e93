// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_std::net::UdpSocket;
use futures::future::{AbortHandle, Abortable};
use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

use icestrans::engine::*;
use icestrans::stun::attribute::*;
use icestrans::stun::message::*;
use icestrans::transport::*;
use icestrans::turn::attribute::{
    self as turn_attr, Data, Lifetime, XorPeerAddress, XorRelayedAddress, XOR_PEER_ADDRESS,
};
use icestrans::turn::{ALLOCATE, CREATE_PERMISSION, DATA, REFRESH, SEND};

static TRACING: Lazy<()> = Lazy::new(|| {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
});

pub fn debug_init() {
    Lazy::force(&TRACING);
}

pub const TIMEOUT: Duration = Duration::from_secs(5);

fn spawn_abortable<F>(fut: F) -> AbortHandle
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let (abort, registration) = AbortHandle::new_pair();
    async_std::task::spawn(Abortable::new(fut, registration));
    abort
}

#[derive(Debug)]
struct FakeStunState {
    mapped: Option<SocketAddr>,
    responding: bool,
    // answer with this error code instead of a mapped address
    error: Option<u16>,
    requests: usize,
}

/// Answers binding requests with the source address, or with an overridden mapped address
pub struct FakeStunServer {
    pub addr: SocketAddr,
    state: Arc<Mutex<FakeStunState>>,
    abort: AbortHandle,
}

impl FakeStunServer {
    pub async fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let state = Arc::new(Mutex::new(FakeStunState {
            mapped: None,
            responding: true,
            error: None,
            requests: 0,
        }));
        let inner_state = state.clone();
        let abort = spawn_abortable(async move {
            let mut buf = [0; 1500];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                let msg = match Message::from_bytes(&buf[..len]) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                };
                if !msg.has_class(MessageClass::Request) || !msg.has_method(BINDING) {
                    continue;
                }
                let (mapped, error) = {
                    let mut state = inner_state.lock().unwrap();
                    state.requests += 1;
                    if !state.responding {
                        continue;
                    }
                    (state.mapped.unwrap_or(from), state.error)
                };
                let mut response = match error {
                    Some(code) => {
                        let mut response = Message::new_error(&msg);
                        response
                            .add_attribute(ErrorCode::new(code, "Server Error").unwrap().into())
                            .unwrap();
                        response
                    }
                    None => {
                        let mut response = Message::new_success(&msg);
                        let mapped = XorMappedAddress::new(mapped, msg.transaction_id());
                        response.add_attribute(mapped.into()).unwrap();
                        response
                    }
                };
                response.add_fingerprint().unwrap();
                let _ = socket.send_to(&response.to_bytes(), from).await;
            }
        });
        Self { addr, state, abort }
    }

    pub fn set_mapped(&self, mapped: Option<SocketAddr>) {
        self.state.lock().unwrap().mapped = mapped;
    }

    pub fn set_responding(&self, responding: bool) {
        self.state.lock().unwrap().responding = responding;
    }

    pub fn set_error(&self, error: Option<u16>) {
        self.state.lock().unwrap().error = error;
    }

    pub fn requests(&self) -> usize {
        self.state.lock().unwrap().requests
    }
}

impl Drop for FakeStunServer {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

pub const TURN_USER: &str = "turnuser";
pub const TURN_PASS: &str = "turnpass";
const TURN_REALM: &str = "icestrans.test";
const TURN_NONCE: &str = "abcdef";

#[derive(Debug, Default)]
struct FakeTurnState {
    client: Option<SocketAddr>,
    reject: bool,
    permissions: Vec<IpAddr>,
    sends: Vec<(SocketAddr, Vec<u8>)>,
    refreshes: Vec<Duration>,
}

/// Minimal TURN server: requires long-term credentials, allocates `relayed` and records what the
/// client sends through it
pub struct FakeTurnServer {
    pub addr: SocketAddr,
    pub relayed: SocketAddr,
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<FakeTurnState>>,
    abort: AbortHandle,
}

fn turn_credentials() -> MessageIntegrityCredentials {
    MessageIntegrityCredentials::LongTerm(LongTermCredentials {
        username: TURN_USER.to_owned(),
        realm: TURN_REALM.to_owned(),
        password: TURN_PASS.to_owned(),
    })
}

fn unauthorized(msg: &Message) -> Message {
    let mut response = Message::new_error(msg);
    response
        .add_attribute(ErrorCode::new(401, "Unauthorized").unwrap().into())
        .unwrap();
    response
        .add_attribute(Realm::new(TURN_REALM).unwrap().into())
        .unwrap();
    response
        .add_attribute(Nonce::new(TURN_NONCE).unwrap().into())
        .unwrap();
    response
}

fn handle_turn_request(
    msg: &Message,
    data: &[u8],
    from: SocketAddr,
    relayed: SocketAddr,
    state: &Mutex<FakeTurnState>,
) -> Option<Message> {
    if msg.has_class(MessageClass::Indication) {
        if msg.has_method(SEND) {
            let peer = XorPeerAddress::try_from(msg.get_attribute(XOR_PEER_ADDRESS)?)
                .ok()?
                .addr(msg.transaction_id());
            let payload = Data::try_from(msg.get_attribute(turn_attr::DATA)?).ok()?;
            state
                .lock()
                .unwrap()
                .sends
                .push((peer, payload.data().to_vec()));
        }
        return None;
    }
    if !msg.has_class(MessageClass::Request) {
        return None;
    }
    if !msg.has_attribute(MESSAGE_INTEGRITY)
        || msg.validate_integrity(data, &turn_credentials()).is_err()
    {
        return Some(unauthorized(msg));
    }

    let mut state = state.lock().unwrap();
    let mut response = Message::new_success(msg);
    match msg.method() {
        ALLOCATE => {
            if state.reject {
                let mut response = Message::new_error(msg);
                response
                    .add_attribute(ErrorCode::new(403, "Forbidden").unwrap().into())
                    .unwrap();
                return Some(response);
            }
            state.client = Some(from);
            response
                .add_attribute(XorRelayedAddress::new(relayed, msg.transaction_id()).into())
                .unwrap();
            response
                .add_attribute(XorMappedAddress::new(from, msg.transaction_id()).into())
                .unwrap();
            response
                .add_attribute(Lifetime::new(Duration::from_secs(600)).into())
                .unwrap();
        }
        REFRESH => {
            let lifetime = Lifetime::try_from(msg.get_attribute(turn_attr::LIFETIME)?)
                .ok()?
                .lifetime();
            state.refreshes.push(lifetime);
            response.add_attribute(Lifetime::new(lifetime).into()).unwrap();
        }
        CREATE_PERMISSION => {
            let peer = XorPeerAddress::try_from(msg.get_attribute(XOR_PEER_ADDRESS)?)
                .ok()?
                .addr(msg.transaction_id());
            state.permissions.push(peer.ip());
        }
        _ => return None,
    }
    Some(response)
}

impl FakeTurnServer {
    pub async fn start() -> Self {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let relayed: SocketAddr = "203.0.113.50:49152".parse().unwrap();
        let state = Arc::new(Mutex::new(FakeTurnState::default()));
        let inner_state = state.clone();
        let inner_socket = socket.clone();
        let abort = spawn_abortable(async move {
            let mut buf = [0; 1500];
            while let Ok((len, from)) = inner_socket.recv_from(&mut buf).await {
                let msg = match Message::from_bytes(&buf[..len]) {
                    Ok(msg) => msg,
                    Err(_) => continue,
                };
                if let Some(mut response) =
                    handle_turn_request(&msg, &buf[..len], from, relayed, &inner_state)
                {
                    response.add_fingerprint().unwrap();
                    let _ = inner_socket.send_to(&response.to_bytes(), from).await;
                }
            }
        });
        Self {
            addr,
            relayed,
            socket,
            state,
            abort,
        }
    }

    pub fn reject_allocations(&self) {
        self.state.lock().unwrap().reject = true;
    }

    pub fn permissions(&self) -> Vec<IpAddr> {
        self.state.lock().unwrap().permissions.clone()
    }

    pub fn sends(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.state.lock().unwrap().sends.clone()
    }

    pub fn refreshes(&self) -> Vec<Duration> {
        self.state.lock().unwrap().refreshes.clone()
    }

    /// Relay `data` from `peer` to the allocation's client
    pub async fn send_data(&self, peer: SocketAddr, data: &[u8]) {
        let client = self.state.lock().unwrap().client.unwrap();
        let mut msg = Message::new_indication_method(DATA);
        msg.add_attribute(XorPeerAddress::new(peer, msg.transaction_id()).into())
            .unwrap();
        msg.add_attribute(Data::new(data).unwrap().into()).unwrap();
        msg.add_fingerprint().unwrap();
        self.socket.send_to(&msg.to_bytes(), client).await.unwrap();
    }
}

impl Drop for FakeTurnServer {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Wait until `f` holds
pub async fn wait_until(mut f: impl FnMut() -> bool) {
    let start = std::time::Instant::now();
    while !f() {
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for condition");
        futures_timer::Delay::new(Duration::from_millis(10)).await;
    }
}

#[derive(Debug)]
pub enum HandlerEvent {
    RxData {
        component_id: usize,
        data: Vec<u8>,
        from: SocketAddr,
    },
    IceComplete {
        op: IceOperation,
        ok: bool,
    },
    AddrChange {
        component_id: usize,
        candidate: usize,
    },
    ComponentFailed {
        component_id: usize,
    },
}

type CompleteHook = Box<dyn Fn(IceOperation) + Send + Sync>;

pub struct RecordingHandler {
    sender: async_channel::Sender<HandlerEvent>,
    on_complete: Mutex<Option<CompleteHook>>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, async_channel::Receiver<HandlerEvent>) {
        let (sender, recv) = async_channel::unbounded();
        (
            Arc::new(Self {
                sender,
                on_complete: Mutex::new(None),
            }),
            recv,
        )
    }

    /// Run `hook` from inside every `on_ice_complete`
    pub fn set_complete_hook(&self, hook: CompleteHook) {
        *self.on_complete.lock().unwrap() = Some(hook);
    }
}

impl TransportHandler for RecordingHandler {
    fn on_rx_data(&self, component_id: usize, data: &[u8], from: SocketAddr) {
        let _ = self.sender.try_send(HandlerEvent::RxData {
            component_id,
            data: data.to_vec(),
            from,
        });
    }

    fn on_ice_complete(&self, op: IceOperation, result: Result<(), TransportError>) {
        if let Some(hook) = self.on_complete.lock().unwrap().as_ref() {
            hook(op);
        }
        let _ = self.sender.try_send(HandlerEvent::IceComplete {
            op,
            ok: result.is_ok(),
        });
    }

    fn on_addr_change(&self, component_id: usize, candidate: usize) {
        let _ = self.sender.try_send(HandlerEvent::AddrChange {
            component_id,
            candidate,
        });
    }

    fn on_component_failed(&self, component_id: usize, _error: TransportError) {
        let _ = self
            .sender
            .try_send(HandlerEvent::ComponentFailed { component_id });
    }
}

/// Next recorded event, failing the test when nothing arrives in time
pub async fn next_event(recv: &async_channel::Receiver<HandlerEvent>) -> HandlerEvent {
    async_std::future::timeout(TIMEOUT, recv.recv())
        .await
        .expect("timed out waiting for a handler event")
        .unwrap()
}

/// Collect events until gathering completes, returning them and whether it succeeded
pub async fn wait_for_init(
    recv: &async_channel::Receiver<HandlerEvent>,
) -> (Vec<HandlerEvent>, bool) {
    let mut events = vec![];
    loop {
        match next_event(recv).await {
            HandlerEvent::IceComplete {
                op: IceOperation::Init,
                ok,
            } => return (events, ok),
            event => events.push(event),
        }
    }
}

#[derive(Debug, Default)]
pub struct MockEngineState {
    pub created: usize,
    pub destroyed: usize,
    pub role: Option<IceRole>,
    pub candidates: Vec<SessionCandidate>,
    pub started: Option<(String, String, usize)>,
    pub received: Vec<(usize, usize, Vec<u8>, SocketAddr)>,
    /// reject the n-th added candidate
    pub fail_add_at: Option<usize>,
    pub sink: Option<EngineSink>,
}

/// Engine indices handed out by the mock start here so they never coincide with store indices
pub const ENGINE_INDEX_BASE: usize = 100;

struct MockEngine {
    state: Arc<Mutex<MockEngineState>>,
}

impl IceEngine for MockEngine {
    fn add_candidate(&mut self, candidate: &SessionCandidate) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_add_at == Some(state.candidates.len()) {
            return Err(TransportError::Engine("candidate table full".to_owned()));
        }
        state.candidates.push(candidate.clone());
        Ok(ENGINE_INDEX_BASE + state.candidates.len() - 1)
    }

    fn start_check(
        &mut self,
        remote_ufrag: &str,
        remote_pwd: &str,
        remote_candidates: &[SessionCandidate],
    ) -> Result<(), TransportError> {
        self.state.lock().unwrap().started = Some((
            remote_ufrag.to_owned(),
            remote_pwd.to_owned(),
            remote_candidates.len(),
        ));
        Ok(())
    }

    fn on_rx_pkt(&mut self, component_id: usize, candidate: usize, data: &[u8], from: SocketAddr) {
        self.state
            .lock()
            .unwrap()
            .received
            .push((component_id, candidate, data.to_vec(), from));
    }

    fn destroy(&mut self) {
        self.state.lock().unwrap().destroyed += 1;
    }
}

#[derive(Clone, Default)]
pub struct MockEngineFactory {
    pub state: Arc<Mutex<MockEngineState>>,
}

impl MockEngineFactory {
    pub fn sink(&self) -> EngineSink {
        self.state.lock().unwrap().sink.clone().unwrap()
    }
}

impl IceEngineFactory for MockEngineFactory {
    fn create(
        &self,
        role: IceRole,
        _local_ufrag: &str,
        _local_pwd: &str,
        sink: EngineSink,
    ) -> Result<Box<dyn IceEngine>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.created += 1;
        state.role = Some(role);
        state.candidates.clear();
        state.sink = Some(sink);
        Ok(Box::new(MockEngine {
            state: self.state.clone(),
        }))
    }
}

/// A STUN binding request as a remote ICE agent would send it
pub fn connectivity_check() -> Vec<u8> {
    let mut msg = Message::new_request_method(BINDING);
    msg.add_fingerprint().unwrap();
    msg.to_bytes()
}
