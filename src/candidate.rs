// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Candidates and the bounded per-component candidate store

use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::stun::message::CRC32;
use crate::transport::TransportError;

/// Default bound on the number of candidates of a single component
pub const MAX_CANDIDATES: usize = 8;

/// Highest component id the candidate priority can express
pub const MAX_COMPONENT_ID: usize = 256;

const SUPERSEDED: &str = "superseded";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    Relayed,
}

impl CandidateType {
    fn foundation_prefix(self) -> char {
        match self {
            CandidateType::Host => 'H',
            CandidateType::ServerReflexive => 'S',
            CandidateType::Relayed => 'R',
        }
    }

    pub fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }
}

#[derive(Debug)]
pub enum ParseCandidateTypeError {
    UnknownCandidateType,
}

impl Error for ParseCandidateTypeError {}

impl std::fmt::Display for ParseCandidateTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.pad(&format!("{:?}", self))
    }
}

impl FromStr for CandidateType {
    type Err = ParseCandidateTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "relay" => Ok(CandidateType::Relayed),
            _ => Err(ParseCandidateTypeError::UnknownCandidateType),
        }
    }
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match &self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relayed => "relay",
        })
    }
}

/// Resolution status of a candidate (or of a candidate slot that is still being resolved)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateStatus {
    Pending,
    Ready,
    Failed(String),
}

impl CandidateStatus {
    fn severity(&self) -> u8 {
        match self {
            CandidateStatus::Ready => 0,
            CandidateStatus::Pending => 1,
            CandidateStatus::Failed(_) => 2,
        }
    }

    /// The more severe of two statuses: `Ready < Pending < Failed`
    ///
    /// # Examples
    ///
    /// ```
    /// # use icestrans::candidate::CandidateStatus;
    /// let failed = CandidateStatus::Failed("timeout".to_owned());
    /// assert_eq!(CandidateStatus::Ready.worst(&CandidateStatus::Pending), CandidateStatus::Pending);
    /// assert_eq!(CandidateStatus::Pending.worst(&failed), failed);
    /// ```
    pub fn worst(&self, other: &CandidateStatus) -> CandidateStatus {
        if other.severity() > self.severity() {
            other.clone()
        } else {
            self.clone()
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, CandidateStatus::Ready)
    }

    /// Status of a server reflexive candidate replaced after the NAT binding moved
    pub fn superseded() -> Self {
        CandidateStatus::Failed(SUPERSEDED.to_owned())
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, CandidateStatus::Failed(reason) if reason == SUPERSEDED)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub component_id: usize,
    pub candidate_type: CandidateType,
    pub address: SocketAddr,
    pub base_address: SocketAddr,
    pub related_address: Option<SocketAddr>,
    pub foundation: String,
    pub local_preference: u16,
    pub priority: u32,
    pub status: CandidateStatus,
    /// Index of this candidate in the ICE engine's own table.  Only set while a session exists.
    pub engine_index: Option<usize>,
}

pub struct CandidateBuilder {
    component_id: usize,
    ctype: CandidateType,
    address: SocketAddr,
    local_preference: u16,
    base_address: Option<SocketAddr>,
    related_address: Option<SocketAddr>,
    status: CandidateStatus,
}

impl CandidateBuilder {
    /// Builds the candidate
    ///
    /// # Examples
    ///
    /// ```
    /// # use icestrans::candidate::*;
    /// # use std::net::SocketAddr;
    /// let addr: SocketAddr = "192.168.1.2:4000".parse().unwrap();
    /// let candidate = Candidate::builder(1, CandidateType::Host, addr)
    ///     .local_preference(65535)
    ///     .build();
    /// assert_eq!(candidate.foundation, "Hc0a80102");
    /// assert_eq!(candidate.base_address, addr);
    /// assert_eq!(candidate.priority, (126 << 24) + (65535 << 8) + 255);
    /// ```
    pub fn build(self) -> Candidate {
        let base_address = self.base_address.unwrap_or(self.address);
        Candidate {
            component_id: self.component_id,
            candidate_type: self.ctype,
            address: self.address,
            base_address,
            related_address: self.related_address,
            foundation: calculate_foundation(self.ctype, base_address),
            local_preference: self.local_preference,
            priority: calculate_priority(self.ctype, self.local_preference, self.component_id),
            status: self.status,
            engine_index: None,
        }
    }

    pub fn local_preference(mut self, local_preference: u16) -> Self {
        self.local_preference = local_preference;
        self
    }

    /// Specify the base address of the to be built candidate.  Defaults to the address.
    pub fn base_address(mut self, base_address: SocketAddr) -> Self {
        self.base_address = Some(base_address);
        self
    }

    pub fn related_address(mut self, related_address: SocketAddr) -> Self {
        self.related_address = Some(related_address);
        self
    }

    pub fn status(mut self, status: CandidateStatus) -> Self {
        self.status = status;
        self
    }
}

impl Candidate {
    /// Construct a builder for a new `Ready` candidate
    pub fn builder(
        component_id: usize,
        ctype: CandidateType,
        address: SocketAddr,
    ) -> CandidateBuilder {
        CandidateBuilder {
            component_id,
            ctype,
            address,
            local_preference: 65535,
            base_address: None,
            related_address: None,
            status: CandidateStatus::Ready,
        }
    }
}

/// Foundation of a candidate.  Only depends on the type and the base address so that candidates
/// of the same type sharing a base address share a foundation.
///
/// # Examples
///
/// ```
/// # use icestrans::candidate::*;
/// let base = "10.0.0.1:5000".parse().unwrap();
/// let other_port = "10.0.0.1:6000".parse().unwrap();
/// assert_eq!(calculate_foundation(CandidateType::ServerReflexive, base), "Sa000001");
/// assert_eq!(
///     calculate_foundation(CandidateType::Host, base),
///     calculate_foundation(CandidateType::Host, other_port)
/// );
/// ```
pub fn calculate_foundation(ctype: CandidateType, base: SocketAddr) -> String {
    let value = match base.ip() {
        IpAddr::V4(ip) => u32::from(ip),
        IpAddr::V6(ip) => CRC32.checksum(&ip.octets()),
    };
    format!("{}{:x}", ctype.foundation_prefix(), value)
}

/// RFC 8445 5.1.2.1 priority.  Component ids above [`MAX_COMPONENT_ID`] get the lowest
/// component preference.
pub fn calculate_priority(
    ctype: CandidateType,
    local_preference: u16,
    component_id: usize,
) -> u32 {
    let component_preference = (MAX_COMPONENT_ID - component_id.min(MAX_COMPONENT_ID)) as u32;
    ((1 << 24) * ctype.type_preference())
        + ((1 << 8) * local_preference as u32)
        + component_preference
}

/// Bounded, insertion ordered list of the candidates of one component
#[derive(Debug, Clone)]
pub struct CandidateStore {
    component_id: usize,
    candidates: Vec<Candidate>,
    capacity: usize,
    default: Option<usize>,
}

impl CandidateStore {
    pub fn new(component_id: usize, capacity: usize) -> Self {
        Self {
            component_id,
            candidates: Vec::with_capacity(capacity),
            capacity,
            default: None,
        }
    }

    pub fn component_id(&self) -> usize {
        self.component_id
    }

    /// Add `candidate` returning its index.  An existing candidate with the same address is not
    /// an error: its index is returned and nothing changes.
    pub fn add(
        &mut self,
        candidate: Candidate,
        set_default: bool,
    ) -> Result<usize, TransportError> {
        if let Some(idx) = self.find_by_address(candidate.address) {
            debug!(
                "component {} already has a candidate for {}, ignoring",
                self.component_id, candidate.address
            );
            return Ok(idx);
        }
        if self.candidates.len() >= self.capacity {
            warn!(
                "component {} has too many candidates ({}), rejecting {}",
                self.component_id,
                self.capacity,
                candidate.address
            );
            return Err(TransportError::TooManyCandidates);
        }
        let idx = self.candidates.len();
        info!(
            "component {} adding {} candidate {} base {} foundation {}",
            self.component_id,
            candidate.candidate_type,
            candidate.address,
            candidate.base_address,
            candidate.foundation
        );
        self.candidates.push(candidate);
        if set_default || self.default.is_none() {
            self.default = Some(idx);
        }
        Ok(idx)
    }

    pub fn get(&self, idx: usize) -> Option<&Candidate> {
        self.candidates.get(idx)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Candidate> {
        self.candidates.get_mut(idx)
    }

    pub fn find_by_address(&self, address: SocketAddr) -> Option<usize> {
        self.candidates.iter().position(|c| c.address == address)
    }

    pub fn find_by_engine_index(&self, engine_index: usize) -> Option<usize> {
        self.candidates
            .iter()
            .position(|c| c.engine_index == Some(engine_index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn default_index(&self) -> Option<usize> {
        self.default
    }

    pub fn default_candidate(&self) -> Option<&Candidate> {
        self.default.and_then(|idx| self.candidates.get(idx))
    }

    pub fn set_default(&mut self, idx: usize) -> Result<(), TransportError> {
        if idx >= self.candidates.len() {
            return Err(TransportError::ResourceNotFound);
        }
        self.default = Some(idx);
        Ok(())
    }

    /// Clones of at most `max` candidates in insertion order
    pub fn snapshot(&self, max: usize) -> Vec<Candidate> {
        self.candidates.iter().take(max).cloned().collect()
    }

    pub fn clear_engine_indices(&mut self) {
        for c in self.candidates.iter_mut() {
            c.engine_index = None;
        }
    }

    /// Worst status over all candidates that are still in use, `None` if there are none
    pub fn worst_status(&self) -> Option<CandidateStatus> {
        self.candidates
            .iter()
            .filter(|c| !c.status.is_superseded())
            .map(|c| c.status.clone())
            .reduce(|acc, s| acc.worst(&s))
    }
}
