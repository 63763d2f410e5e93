// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The ICE stream transport
//!
//! Every piece of internal activity (datagrams, STUN timeouts, TURN state changes, keep-alive
//! fires and requests from the ICE engine) is posted to a single queue and handled in order by
//! one dispatch task.  State is only touched with the transport locked and application
//! callbacks are only invoked with it unlocked, so a callback may call straight back into the
//! transport (e.g. [`IceTransport::stop_ice`] from
//! [`TransportHandler::on_ice_complete`]).

use std::error::Error;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use futures::future::AbortHandle;
use tracing_futures::Instrument;

use crate::candidate::{Candidate, CandidateStatus, CandidateType};
use crate::component::{Component, ComponentUpdate, SendPath};
use crate::config::{ComponentOptions, TransportConfig};
use crate::engine::{EngineSink, IceEngine, IceEngineFactory, IceRole, SessionCandidate};
use crate::keepalive::KeepAliveTimer;
use crate::router::{classify, Route};
use crate::turn::TurnEvent;

pub use crate::component::{RTCP, RTP};

#[derive(Debug)]
pub enum TransportError {
    /// The operation is not allowed in the current state
    InvalidOperation,
    TooManyCandidates,
    TooManyComponents,
    ResourceNotFound,
    AlreadyExists,
    NotEnoughData,
    InvalidSize,
    Malformed,
    WrongImplementation,
    TooBig,
    IntegrityCheckFailed,
    NoMappedAddress,
    /// An error response from a STUN or TURN server
    StunError {
        code: u16,
        reason: String,
    },
    Resolution(String),
    TimedOut,
    ConnectionClosed,
    Engine(String),
    IoError(std::io::Error),
}

impl Error for TransportError {}

impl Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e)
    }
}

#[derive(Debug)]
pub(crate) enum TransportEvent {
    Datagram {
        component_id: usize,
        data: Vec<u8>,
        from: SocketAddr,
    },
    ReadFailed {
        component_id: usize,
        error: String,
    },
    StunTimeout {
        component_id: usize,
        transaction: u128,
    },
    KeepAlive,
    Turn {
        component_id: usize,
        generation: u64,
        event: TurnEvent,
    },
    EngineTransmit {
        session: u64,
        component_id: usize,
        candidate: usize,
        data: Vec<u8>,
        to: SocketAddr,
    },
    EngineData {
        session: u64,
        component_id: usize,
        data: Vec<u8>,
        from: SocketAddr,
    },
    EngineComplete {
        session: u64,
        result: Result<(), TransportError>,
    },
    CheckGathering,
}

/// What an [`on_ice_complete`](TransportHandler::on_ice_complete) notification is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceOperation {
    /// Candidate gathering finished
    Init,
    /// Connectivity checks finished
    Negotiation,
    /// The server reflexive address changed while a session owns the candidates
    AddressChange,
}

/// Application callbacks.  All of them are called from the transport's dispatch task with the
/// transport unlocked.
pub trait TransportHandler: Send + Sync {
    /// Non-ICE data received on `component_id`
    fn on_rx_data(&self, component_id: usize, data: &[u8], from: SocketAddr);

    fn on_ice_complete(&self, _op: IceOperation, _result: Result<(), TransportError>) {}

    /// `candidate` became the default candidate of `component_id`
    fn on_addr_change(&self, _component_id: usize, _candidate: usize) {}

    /// The socket of `component_id` stopped working
    fn on_component_failed(&self, _component_id: usize, _error: TransportError) {}
}

#[derive(Debug)]
struct DiscardHandler;

impl TransportHandler for DiscardHandler {
    fn on_rx_data(&self, component_id: usize, data: &[u8], from: SocketAddr) {
        trace!(
            "discarding {} bytes from {} on component {}",
            data.len(),
            from,
            component_id
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No components
    Created,
    Gathering,
    /// Gathering completed, a session can be initialised
    Ready,
    SessionActive,
    Negotiating,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug)]
enum Action {
    Send {
        path: SendPath,
        data: Vec<u8>,
        to: SocketAddr,
    },
    RxData {
        component_id: usize,
        data: Vec<u8>,
        from: SocketAddr,
    },
    AddrChange {
        component_id: usize,
        candidate: usize,
    },
    IceComplete {
        op: IceOperation,
        result: Result<(), TransportError>,
    },
    ComponentFailed {
        component_id: usize,
        error: TransportError,
    },
}

#[derive(Derivative)]
#[derivative(Debug)]
struct TransportInner {
    config: TransportConfig,
    state: TransportState,
    components: Vec<Component>,
    #[derivative(Debug = "ignore")]
    engine_factory: Option<Arc<dyn IceEngineFactory>>,
    #[derivative(Debug = "ignore")]
    engine: Option<Box<dyn IceEngine>>,
    session: u64,
    keep_alive: KeepAliveTimer,
    next_generation: u64,
    // a component is being created with the transport unlocked
    adding: bool,
    init_notified: bool,
    destroyed: bool,
    events: async_channel::Sender<TransportEvent>,
    dispatch: Option<AbortHandle>,
}

impl TransportInner {
    fn component(&self, component_id: usize) -> Option<&Component> {
        self.components.iter().find(|c| c.id == component_id)
    }

    fn component_mut(&mut self, component_id: usize) -> Option<&mut Component> {
        self.components.iter_mut().find(|c| c.id == component_id)
    }

    fn session_active(&self) -> bool {
        self.engine.is_some()
    }

    fn apply_update(
        component_id: usize,
        update: Option<ComponentUpdate>,
        actions: &mut Vec<Action>,
    ) {
        match update {
            Some(ComponentUpdate::AddrChange(candidate)) => actions.push(Action::AddrChange {
                component_id,
                candidate,
            }),
            Some(ComponentUpdate::AddressChangedInSession) => actions.push(Action::IceComplete {
                op: IceOperation::AddressChange,
                result: Ok(()),
            }),
            None => (),
        }
    }

    fn update_keep_alive(&mut self) {
        if self.components.iter().any(|c| c.wants_keep_alive()) {
            self.keep_alive.arm(&self.events);
        }
    }

    // Reports gathering completion once nothing is pending anymore.  Gathering succeeded when
    // every component has at least one usable candidate.
    fn check_gathering(&mut self, actions: &mut Vec<Action>) {
        if self.init_notified
            || self.adding
            || self.components.is_empty()
            || self.state != TransportState::Gathering
        {
            return;
        }
        if self.components.iter().any(|c| c.pending() > 0) {
            return;
        }
        self.init_notified = true;
        self.state = TransportState::Ready;
        let result = match self.components.iter().find(|c| !c.has_ready_candidate()) {
            None => Ok(()),
            Some(c) => Err(TransportError::Resolution(format!(
                "component {}: {}",
                c.id,
                c.last_error().unwrap_or("no usable candidate")
            ))),
        };
        info!("gathering completed: {:?}", result);
        actions.push(Action::IceComplete {
            op: IceOperation::Init,
            result,
        });
    }

    fn handle_datagram(
        &mut self,
        component_id: usize,
        data: Vec<u8>,
        from: SocketAddr,
        actions: &mut Vec<Action>,
    ) {
        let session_active = self.session_active();
        let component = match self.component_mut(component_id) {
            Some(c) => c,
            None => return,
        };
        match classify(&data, &component.route_context(session_active)) {
            Route::StunClient => {
                let update = component.on_stun_datagram(&data, session_active);
                TransportInner::apply_update(component_id, update, actions);
                self.update_keep_alive();
                self.check_gathering(actions);
            }
            Route::Engine { candidate } => {
                if let Some(engine) = self.engine.as_mut() {
                    engine.on_rx_pkt(component_id, candidate, &data, from);
                }
            }
            Route::Application => actions.push(Action::RxData {
                component_id,
                data,
                from,
            }),
            Route::Drop(reason) => trace!(
                "dropping {} bytes from {} on component {}: {}",
                data.len(),
                from,
                component_id,
                reason
            ),
        }
    }

    fn handle_turn_event(
        &mut self,
        component_id: usize,
        generation: u64,
        event: TurnEvent,
        actions: &mut Vec<Action>,
    ) {
        let session_active = self.session_active();
        let component = match self.component_mut(component_id) {
            Some(c) => c,
            None => return,
        };
        match event {
            TurnEvent::StateChanged { new, .. } => {
                let update = component.on_turn_state(generation, new);
                TransportInner::apply_update(component_id, update, actions);
                self.check_gathering(actions);
            }
            TurnEvent::Data { data, peer } => {
                if component.turn_generation() != Some(generation) {
                    return;
                }
                match classify(&data, &component.relay_route_context(session_active)) {
                    Route::Engine { candidate } => {
                        if let Some(engine) = self.engine.as_mut() {
                            engine.on_rx_pkt(component_id, candidate, &data, peer);
                        }
                    }
                    Route::Application => actions.push(Action::RxData {
                        component_id,
                        data,
                        from: peer,
                    }),
                    route => trace!("dropping relayed data from {}: {:?}", peer, route),
                }
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) -> Vec<Action> {
        let mut actions = vec![];
        match event {
            TransportEvent::Datagram {
                component_id,
                data,
                from,
            } => self.handle_datagram(component_id, data, from, &mut actions),
            TransportEvent::ReadFailed {
                component_id,
                error,
            } => {
                if let Some(component) = self.component_mut(component_id) {
                    warn!("component {} socket failed: {}", component_id, error);
                    component.set_last_error(error.clone());
                    actions.push(Action::ComponentFailed {
                        component_id,
                        error: TransportError::IoError(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            error,
                        )),
                    });
                }
            }
            TransportEvent::StunTimeout {
                component_id,
                transaction,
            } => {
                if let Some(component) = self.component_mut(component_id) {
                    component.on_stun_timeout(transaction);
                }
                self.update_keep_alive();
                self.check_gathering(&mut actions);
            }
            TransportEvent::KeepAlive => {
                let events = self.events.clone();
                let mut any = false;
                for component in self.components.iter_mut() {
                    if !component.wants_keep_alive() {
                        continue;
                    }
                    any = true;
                    if let Err(e) = component.send_keep_alive(&events) {
                        warn!("component {} keep-alive failed: {}", component.id, e);
                    }
                }
                if !any {
                    self.keep_alive.cancel();
                }
            }
            TransportEvent::Turn {
                component_id,
                generation,
                event,
            } => self.handle_turn_event(component_id, generation, event, &mut actions),
            TransportEvent::EngineTransmit {
                session,
                component_id,
                candidate,
                data,
                to,
            } => {
                if session != self.session || !self.session_active() {
                    trace!("ignoring transmit from stale session {}", session);
                    return actions;
                }
                let path = self.component(component_id).and_then(|c| {
                    c.store
                        .find_by_engine_index(candidate)
                        .and_then(|idx| c.send_path(idx).ok())
                });
                match path {
                    Some(path) => actions.push(Action::Send { path, data, to }),
                    None => debug!(
                        "no local candidate {} on component {} to send from",
                        candidate, component_id
                    ),
                }
            }
            TransportEvent::EngineData {
                session,
                component_id,
                data,
                from,
            } => {
                if session == self.session && self.session_active() {
                    actions.push(Action::RxData {
                        component_id,
                        data,
                        from,
                    });
                }
            }
            TransportEvent::EngineComplete { session, result } => {
                if session != self.session || !self.session_active() {
                    trace!("ignoring completion of stale session {}", session);
                    return actions;
                }
                self.state = if result.is_ok() {
                    TransportState::Completed
                } else {
                    TransportState::Failed
                };
                actions.push(Action::IceComplete {
                    op: IceOperation::Negotiation,
                    result,
                });
            }
            TransportEvent::CheckGathering => self.check_gathering(&mut actions),
        }
        actions
    }
}

async fn perform(actions: Vec<Action>, handler: &Arc<dyn TransportHandler>) {
    for action in actions {
        match action {
            Action::Send {
                path: SendPath::Relay(turn),
                data,
                to,
            } => {
                // permission creation may take a round trip, don't hold up the dispatch
                async_std::task::spawn(
                    async move {
                        if let Err(e) = turn.send_to(&data, to).await {
                            warn!("failed to relay to {}: {}", to, e);
                        }
                    }
                    .instrument(debug_span!("relay_send")),
                );
            }
            Action::Send { path, data, to } => {
                if let Err(e) = path.send(&data, to).await {
                    warn!("failed to send to {}: {}", to, e);
                }
            }
            Action::RxData {
                component_id,
                data,
                from,
            } => handler.on_rx_data(component_id, &data, from),
            Action::AddrChange {
                component_id,
                candidate,
            } => handler.on_addr_change(component_id, candidate),
            Action::IceComplete { op, result } => handler.on_ice_complete(op, result),
            Action::ComponentFailed {
                component_id,
                error,
            } => handler.on_component_failed(component_id, error),
        }
    }
}

async fn dispatch(
    weak: Weak<Mutex<TransportInner>>,
    handler: Arc<dyn TransportHandler>,
    events: async_channel::Receiver<TransportEvent>,
) {
    while let Ok(event) = events.recv().await {
        trace!("handling {:?}", event);
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        let actions = inner.lock().unwrap().handle_event(event);
        drop(inner);
        perform(actions, &handler).await;
    }
    debug!("dispatch loop exited");
}

pub struct IceTransportBuilder {
    config: TransportConfig,
    handler: Option<Arc<dyn TransportHandler>>,
    engine: Option<Arc<dyn IceEngineFactory>>,
}

impl IceTransportBuilder {
    pub fn handler(mut self, handler: Arc<dyn TransportHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// The connectivity check engine used by [`IceTransport::init_ice`]
    pub fn engine(mut self, engine: Arc<dyn IceEngineFactory>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> IceTransport {
        let (send, recv) = async_channel::unbounded();
        let inner = Arc::new(Mutex::new(TransportInner {
            keep_alive: KeepAliveTimer::new(self.config.keep_alive.clone()),
            config: self.config,
            state: TransportState::Created,
            components: vec![],
            engine_factory: self.engine,
            engine: None,
            session: 0,
            next_generation: 0,
            adding: false,
            init_notified: false,
            destroyed: false,
            events: send.clone(),
            dispatch: None,
        }));
        let handler = self
            .handler
            .unwrap_or_else(|| Arc::new(DiscardHandler) as Arc<dyn TransportHandler>);
        let (fut, abort) =
            futures::future::abortable(dispatch(Arc::downgrade(&inner), handler, recv));
        async_std::task::spawn(fut.instrument(debug_span!("ice_transport")));
        inner.lock().unwrap().dispatch = Some(abort);
        IceTransport {
            inner,
            events: send,
            component_lock: Arc::new(async_std::sync::Mutex::new(())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IceTransport {
    inner: Arc<Mutex<TransportInner>>,
    events: async_channel::Sender<TransportEvent>,
    // serialises component creation and removal
    component_lock: Arc<async_std::sync::Mutex<()>>,
}

impl IceTransport {
    /// # Examples
    ///
    /// ```
    /// # use icestrans::config::TransportConfig;
    /// # use icestrans::transport::{IceTransport, TransportState};
    /// # async_std::task::block_on(async {
    /// let transport = IceTransport::builder(TransportConfig::default()).build();
    /// assert_eq!(transport.state(), TransportState::Created);
    /// # });
    /// ```
    pub fn builder(config: TransportConfig) -> IceTransportBuilder {
        IceTransportBuilder {
            config,
            handler: None,
            engine: None,
        }
    }

    pub fn state(&self) -> TransportState {
        self.inner.lock().unwrap().state
    }

    pub fn component_count(&self) -> usize {
        self.inner.lock().unwrap().components.len()
    }

    /// Add a component bound to `bind_hint`, returning its id.  Ids start at [`RTP`] and follow
    /// creation order.  Gathering completion is reported again through
    /// [`TransportHandler::on_ice_complete`] once the new component has resolved its candidates.
    #[tracing::instrument(name = "add_component", skip(self, options))]
    pub async fn add_component(
        &self,
        options: ComponentOptions,
        bind_hint: SocketAddr,
    ) -> Result<usize, TransportError> {
        let _guard = self.component_lock.lock().await;
        let (id, generation, config, previous) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.destroyed
                || !matches!(
                    inner.state,
                    TransportState::Created | TransportState::Gathering | TransportState::Ready
                )
            {
                return Err(TransportError::InvalidOperation);
            }
            if inner.components.len() >= inner.config.max_components {
                return Err(TransportError::TooManyComponents);
            }
            let previous = (inner.state, inner.init_notified);
            inner.adding = true;
            inner.state = TransportState::Gathering;
            inner.init_notified = false;
            inner.next_generation += 1;
            (
                inner.components.len() + 1,
                inner.next_generation,
                inner.config.clone(),
                previous,
            )
        };

        let created =
            Component::create(id, &options, bind_hint, &config, generation, &self.events).await;

        let mut inner = self.inner.lock().unwrap();
        inner.adding = false;
        let ret = match created {
            Ok(_) if inner.destroyed => Err(TransportError::InvalidOperation),
            Ok(mut component) => {
                info!(
                    "added component {} on {}",
                    component.id,
                    component.base_address()
                );
                component.start(&self.events);
                inner.components.push(component);
                inner.update_keep_alive();
                Ok(id)
            }
            Err(e) => {
                warn!("failed to create component {}: {}", id, e);
                inner.state = previous.0;
                inner.init_notified = previous.1;
                Err(e)
            }
        };
        let _ = self.events.try_send(TransportEvent::CheckGathering);
        ret
    }

    /// Remove the most recently added component
    pub async fn remove_component(&self) -> Result<(), TransportError> {
        let _guard = self.component_lock.lock().await;
        let turn = {
            let mut inner = self.inner.lock().unwrap();
            if inner.destroyed
                || !matches!(
                    inner.state,
                    TransportState::Created | TransportState::Gathering | TransportState::Ready
                )
            {
                return Err(TransportError::InvalidOperation);
            }
            let mut component = inner
                .components
                .pop()
                .ok_or(TransportError::ResourceNotFound)?;
            info!("removing component {}", component.id);
            if inner.components.is_empty() {
                inner.state = TransportState::Created;
                inner.init_notified = false;
            }
            component.close()
        };
        let _ = self.events.try_send(TransportEvent::CheckGathering);
        if let Some(turn) = turn {
            turn.close().await;
        }
        Ok(())
    }

    /// Add a candidate to `component_id`, returning its index.  Adding an address that already
    /// exists returns the existing index.
    pub fn add_candidate(
        &self,
        component_id: usize,
        candidate_type: CandidateType,
        local_preference: u16,
        address: SocketAddr,
        set_default: bool,
    ) -> Result<usize, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.session_active() || inner.destroyed {
            return Err(TransportError::InvalidOperation);
        }
        let component = inner
            .component_mut(component_id)
            .ok_or(TransportError::ResourceNotFound)?;
        let candidate = Candidate::builder(component_id, candidate_type, address)
            .local_preference(local_preference)
            .build();
        component.store.add(candidate, set_default)
    }

    pub fn candidates(&self, component_id: usize) -> Result<Vec<Candidate>, TransportError> {
        let inner = self.inner.lock().unwrap();
        let max = inner.config.max_candidates;
        inner
            .component(component_id)
            .map(|c| c.store.snapshot(max))
            .ok_or(TransportError::ResourceNotFound)
    }

    pub fn default_candidate(
        &self,
        component_id: usize,
    ) -> Result<Option<Candidate>, TransportError> {
        let inner = self.inner.lock().unwrap();
        inner
            .component(component_id)
            .map(|c| c.store.default_candidate().cloned())
            .ok_or(TransportError::ResourceNotFound)
    }

    pub fn component_status(&self, component_id: usize) -> Result<CandidateStatus, TransportError> {
        let inner = self.inner.lock().unwrap();
        inner
            .component(component_id)
            .map(|c| c.status())
            .ok_or(TransportError::ResourceNotFound)
    }

    pub fn last_error(&self, component_id: usize) -> Result<Option<String>, TransportError> {
        let inner = self.inner.lock().unwrap();
        inner
            .component(component_id)
            .map(|c| c.last_error().map(str::to_owned))
            .ok_or(TransportError::ResourceNotFound)
    }

    /// Worst status over all components
    pub fn gathering_status(&self) -> CandidateStatus {
        let inner = self.inner.lock().unwrap();
        inner
            .components
            .iter()
            .fold(CandidateStatus::Ready, |acc, c| acc.worst(&c.status()))
    }

    /// Create the ICE engine and hand it every Ready candidate.  Only possible once gathering
    /// completed and no session exists.  Nothing changes on failure.
    pub fn init_ice(
        &self,
        role: IceRole,
        local_ufrag: &str,
        local_pwd: &str,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.destroyed
            || inner.session_active()
            || !matches!(inner.state, TransportState::Ready | TransportState::Stopped)
        {
            return Err(TransportError::InvalidOperation);
        }
        let factory = inner
            .engine_factory
            .clone()
            .ok_or(TransportError::InvalidOperation)?;
        let session = inner.session + 1;
        let sink = EngineSink::new(session, self.events.clone());
        let mut engine = factory.create(role, local_ufrag, local_pwd, sink)?;

        let mut registered = vec![];
        for (component_idx, component) in inner.components.iter().enumerate() {
            for (idx, candidate) in component.store.iter().enumerate() {
                if !candidate.status.is_ready() {
                    continue;
                }
                match engine.add_candidate(&SessionCandidate::from(candidate)) {
                    Ok(engine_index) => registered.push((component_idx, idx, engine_index)),
                    Err(e) => {
                        warn!("engine rejected candidate {}: {}", candidate.address, e);
                        engine.destroy();
                        return Err(e);
                    }
                }
            }
        }
        for (component_idx, idx, engine_index) in registered {
            if let Some(candidate) = inner.components[component_idx].store.get_mut(idx) {
                candidate.engine_index = Some(engine_index);
            }
        }
        info!("session {} initialised as {:?}", session, role);
        inner.engine = Some(engine);
        inner.session = session;
        inner.state = TransportState::SessionActive;
        Ok(())
    }

    /// Start connectivity checks.  Completion is reported with [`IceOperation::Negotiation`].
    /// Components with a relay get TURN permissions for their remote candidates so the
    /// peer's checks are let through.
    pub fn start_ice(
        &self,
        remote_ufrag: &str,
        remote_pwd: &str,
        remote_candidates: &[SessionCandidate],
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != TransportState::SessionActive {
            return Err(TransportError::InvalidOperation);
        }
        let engine = inner
            .engine
            .as_mut()
            .ok_or(TransportError::InvalidOperation)?;
        engine.start_check(remote_ufrag, remote_pwd, remote_candidates)?;
        inner.state = TransportState::Negotiating;

        for component in inner.components.iter() {
            let turn = match component.ready_relay() {
                Some(turn) => turn,
                None => continue,
            };
            let peers: Vec<SocketAddr> = remote_candidates
                .iter()
                .filter(|c| c.component_id == component.id)
                .map(|c| c.address)
                .collect();
            if peers.is_empty() {
                continue;
            }
            async_std::task::spawn(
                async move { turn.install_permissions(&peers).await }
                    .instrument(debug_span!("turn_permissions", component.id = component.id)),
            );
        }
        Ok(())
    }

    /// Destroy the engine.  Sockets, STUN and TURN clients and the keep-alive timer keep running
    /// so a new session can be initialised later.
    pub fn stop_ice(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();
        let mut engine = match inner.engine.take() {
            Some(engine) => engine,
            None => return Ok(()),
        };
        info!("stopping session {}", inner.session);
        engine.destroy();
        for component in inner.components.iter_mut() {
            component.store.clear_engine_indices();
        }
        inner.state = TransportState::Stopped;
        Ok(())
    }

    /// Send `data` to `to` from the default candidate of `component_id`, through the TURN client
    /// when that is a relayed candidate.
    pub async fn sendto(
        &self,
        component_id: usize,
        data: &[u8],
        to: SocketAddr,
    ) -> Result<(), TransportError> {
        let path = {
            let inner = self.inner.lock().unwrap();
            if inner.destroyed {
                return Err(TransportError::InvalidOperation);
            }
            inner
                .component(component_id)
                .ok_or(TransportError::ResourceNotFound)?
                .default_send_path()?
        };
        path.send(data, to).await
    }

    /// Tear everything down.  No callback is invoked afterwards.
    #[tracing::instrument(name = "destroy_transport", skip(self))]
    pub async fn destroy(&self) {
        let turns = {
            let mut inner = self.inner.lock().unwrap();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            if let Some(mut engine) = inner.engine.take() {
                engine.destroy();
            }
            inner.keep_alive.cancel();
            if let Some(abort) = inner.dispatch.take() {
                abort.abort();
            }
            inner.state = TransportState::Stopped;
            let mut turns = vec![];
            for mut component in inner.components.drain(..) {
                if let Some(turn) = component.close() {
                    turns.push(turn);
                }
            }
            turns
        };
        for turn in turns {
            turn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;
    use std::time::Duration;

    fn init() {
        crate::tests::test_init_log();
    }

    #[derive(Debug, Default)]
    struct Recorder {
        completions: Mutex<Vec<(IceOperation, bool)>>,
    }

    impl TransportHandler for Recorder {
        fn on_rx_data(&self, _component_id: usize, _data: &[u8], _from: SocketAddr) {}

        fn on_ice_complete(&self, op: IceOperation, result: Result<(), TransportError>) {
            self.completions.lock().unwrap().push((op, result.is_ok()));
        }
    }

    async fn wait_for_state(transport: &IceTransport, state: TransportState) {
        for _ in 0..100 {
            if transport.state() == state {
                return;
            }
            futures_timer::Delay::new(Duration::from_millis(10)).await;
        }
        panic!("transport never reached {:?}", state);
    }

    #[test]
    fn errors_display() {
        init();
        assert_eq!(
            TransportError::InvalidOperation.to_string(),
            "InvalidOperation"
        );
        let io = TransportError::from(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert!(matches!(io, TransportError::IoError(_)));
    }

    #[test]
    fn component_lifecycle() {
        init();
        task::block_on(async move {
            let recorder = Arc::new(Recorder::default());
            let transport = IceTransport::builder(TransportConfig::default())
                .handler(recorder.clone())
                .build();
            assert!(matches!(
                transport.remove_component().await,
                Err(TransportError::ResourceNotFound)
            ));
            let bind = "127.0.0.1:0".parse().unwrap();
            assert_eq!(
                transport
                    .add_component(ComponentOptions::default(), bind)
                    .await
                    .unwrap(),
                RTP
            );
            assert_eq!(
                transport
                    .add_component(ComponentOptions::default(), bind)
                    .await
                    .unwrap(),
                RTCP
            );
            assert!(matches!(
                transport
                    .add_component(ComponentOptions::default(), bind)
                    .await,
                Err(TransportError::TooManyComponents)
            ));
            wait_for_state(&transport, TransportState::Ready).await;
            assert_eq!(transport.gathering_status(), CandidateStatus::Ready);
            assert!(recorder
                .completions
                .lock()
                .unwrap()
                .iter()
                .all(|(op, ok)| *op == IceOperation::Init && *ok));

            transport.remove_component().await.unwrap();
            assert_eq!(transport.component_count(), 1);
            assert!(matches!(
                transport.candidates(RTCP),
                Err(TransportError::ResourceNotFound)
            ));
            transport.remove_component().await.unwrap();
            assert_eq!(transport.state(), TransportState::Created);
            transport.destroy().await;
            assert!(matches!(
                transport
                    .add_component(ComponentOptions::default(), bind)
                    .await,
                Err(TransportError::InvalidOperation)
            ));
        })
    }

    #[test]
    fn init_ice_without_engine() {
        init();
        task::block_on(async move {
            let transport = IceTransport::builder(TransportConfig::default()).build();
            // nothing gathered yet
            assert!(matches!(
                transport.init_ice(IceRole::Controlling, "u", "p"),
                Err(TransportError::InvalidOperation)
            ));
            transport
                .add_component(ComponentOptions::default(), "127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
            wait_for_state(&transport, TransportState::Ready).await;
            assert!(matches!(
                transport.init_ice(IceRole::Controlling, "u", "p"),
                Err(TransportError::InvalidOperation)
            ));
            assert_eq!(transport.state(), TransportState::Ready);
            // nothing to stop
            transport.stop_ice().unwrap();
            assert_eq!(transport.state(), TransportState::Ready);
        })
    }
}
