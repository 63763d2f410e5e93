// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! UDP socket adapter: binding with port retry, the per-socket read loop and local interface
//! enumeration.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_std::net::UdpSocket;
use futures::future::AbortHandle;
use get_if_addrs::get_if_addrs;
use tracing_futures::Instrument;

use crate::config::AddressFamily;
use crate::transport::{TransportError, TransportEvent};

/// Number of additional ports tried (in steps of 2) when the requested one is in use
pub const MAX_BIND_RETRY: u16 = 100;

const RECV_BUFFER_SIZE: usize = 2000;
// consecutive read errors before the socket is considered dead
const MAX_READ_RETRY: usize = 8;

#[derive(Debug)]
pub struct UdpSocketChannel {
    socket: Arc<UdpSocket>,
    inner: Mutex<UdpSocketChannelInner>,
}

#[derive(Debug)]
struct UdpSocketChannelInner {
    receive_loop: Option<AbortHandle>,
}

impl UdpSocketChannel {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            inner: Mutex::new(UdpSocketChannelInner { receive_loop: None }),
        }
    }

    /// Bind to `bind_hint`.  If the port is in use, try the following ports with the same parity
    /// unless `no_port_retry` is set or an ephemeral port was requested.
    pub async fn bind(bind_hint: SocketAddr, no_port_retry: bool) -> Result<Self, TransportError> {
        let retries = if no_port_retry || bind_hint.port() == 0 {
            0
        } else {
            MAX_BIND_RETRY
        };
        let mut addr = bind_hint;
        let mut last_err = None;
        for _ in 0..=retries {
            match UdpSocket::bind(addr).await {
                Ok(socket) => {
                    debug!("bound udp socket to {:?}", socket.local_addr());
                    return Ok(Self::new(socket));
                }
                Err(e) => {
                    debug!("failed to bind {}: {}", addr, e);
                    last_err = Some(e);
                }
            }
            match addr.port().checked_add(2) {
                Some(port) => addr.set_port(port),
                None => break,
            }
        }
        Err(last_err
            .map(TransportError::IoError)
            .unwrap_or(TransportError::ResourceNotFound))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    pub async fn send_to(&self, data: &[u8], to: SocketAddr) -> std::io::Result<()> {
        trace!("sending {} bytes to {}", data.len(), to);
        self.socket.send_to(data, to).await?;
        Ok(())
    }

    /// Read datagrams until the socket is closed, posting each one as an event for
    /// `component_id`.  Does nothing if the loop is already running.
    pub(crate) fn start_receive_loop(
        &self,
        component_id: usize,
        events: async_channel::Sender<TransportEvent>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        if inner.receive_loop.is_some() {
            return;
        }
        let socket = self.socket.clone();
        let (fut, abort) = futures::future::abortable(async move {
            let mut errors = 0;
            loop {
                let mut data = vec![0; RECV_BUFFER_SIZE];
                match socket.recv_from(&mut data).await {
                    Ok((len, from)) => {
                        errors = 0;
                        data.truncate(len);
                        trace!("got {} bytes from {}", len, from);
                        let event = TransportEvent::Datagram {
                            component_id,
                            data,
                            from,
                        };
                        if events.try_send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        errors += 1;
                        warn!("read error {} ({}/{})", e, errors, MAX_READ_RETRY);
                        if errors >= MAX_READ_RETRY {
                            let _ = events.try_send(TransportEvent::ReadFailed {
                                component_id,
                                error: e.to_string(),
                            });
                            break;
                        }
                    }
                }
            }
            trace!("receive loop exited");
        });
        async_std::task::spawn(
            fut.instrument(debug_span!("udp_recv", component.id = component_id)),
        );
        inner.receive_loop = Some(abort);
    }

    /// Stop the read loop.  No event for this socket is posted afterwards.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(abort) = inner.receive_loop.take() {
            debug!("closing socket {:?}", self.socket.local_addr());
            abort.abort();
        }
    }
}

impl Drop for UdpSocketChannel {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) fn wildcard_address(af: AddressFamily) -> SocketAddr {
    match af {
        AddressFamily::Ipv4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        AddressFamily::Ipv6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_link_local(),
        IpAddr::V6(ip) => ip.segments()[0] & 0xffc0 == 0xfe80,
    }
}

/// Addresses of the local non-loopback interfaces of the requested family
pub fn host_addresses(af: AddressFamily, max: usize) -> Result<Vec<IpAddr>, TransportError> {
    let mut ifaces = get_if_addrs()?;
    ifaces.retain(|iface| !iface.is_loopback());
    let mut ret: Vec<IpAddr> = vec![];
    for iface in ifaces {
        if ret.len() >= max {
            break;
        }
        let ip = iface.ip();
        if !af.matches(&SocketAddr::new(ip, 0)) {
            continue;
        }
        if matches!(ip, IpAddr::V6(_)) && is_link_local(&ip) {
            trace!("ignoring link-local address {} of {}", ip, iface.name);
            continue;
        }
        if ret.contains(&ip) {
            continue;
        }
        info!("found interface {} address {}", iface.name, ip);
        ret.push(ip);
    }
    Ok(ret)
}

/// IP address of the interface used for the default route.  Connecting a UDP socket does not
/// send any packet.
pub async fn default_local_ip(af: AddressFamily) -> Option<IpAddr> {
    let target: SocketAddr = match af {
        AddressFamily::Ipv4 => "8.8.8.8:53".parse().ok()?,
        AddressFamily::Ipv6 => "[2001:4860:4860::8888]:53".parse().ok()?,
    };
    let socket = UdpSocket::bind(wildcard_address(af)).await.ok()?;
    socket.connect(target).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() {
        None
    } else {
        Some(ip)
    }
}
