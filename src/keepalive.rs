// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::time::Duration;

use futures::future::AbortHandle;
use futures_timer::Delay;
use rand::{thread_rng, Rng};
use tracing_futures::Instrument;

use crate::config::KeepAliveConfig;
use crate::transport::TransportEvent;

/// `interval` plus a uniformly random jitter so that keep-alives of many transports don't
/// line up
fn next_delay(config: &KeepAliveConfig) -> Duration {
    let jitter = config.jitter.as_millis() as u64;
    let extra = if jitter > 0 {
        thread_rng().gen_range(0..=jitter)
    } else {
        0
    };
    config.interval + Duration::from_millis(extra)
}

/// The single keep-alive timer of a transport.  While armed it posts a
/// [`TransportEvent::KeepAlive`] after every (jittered) interval.
#[derive(Debug)]
pub(crate) struct KeepAliveTimer {
    config: KeepAliveConfig,
    task: Option<AbortHandle>,
}

impl KeepAliveTimer {
    pub(crate) fn new(config: KeepAliveConfig) -> Self {
        Self { config, task: None }
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.task.is_some()
    }

    pub(crate) fn arm(&mut self, events: &async_channel::Sender<TransportEvent>) {
        if self.is_armed() {
            return;
        }
        debug!("arming keep-alive timer");
        let config = self.config.clone();
        let events = events.clone();
        let (fut, abort) = futures::future::abortable(async move {
            loop {
                Delay::new(next_delay(&config)).await;
                trace!("keep-alive timer fired");
                if events.try_send(TransportEvent::KeepAlive).is_err() {
                    break;
                }
            }
        });
        async_std::task::spawn(fut.instrument(debug_span!("keep_alive")));
        self.task = Some(abort);
    }

    pub(crate) fn cancel(&mut self) {
        if let Some(abort) = self.task.take() {
            debug!("cancelling keep-alive timer");
            abort.abort();
        }
    }
}

impl Drop for KeepAliveTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
