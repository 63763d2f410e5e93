// Copyright (C) 2020 Matthew Waters <matthew@centricular.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::stun::message::{is_stun_message, parse_header};

/// What the transport knows about a component when a datagram arrives on it
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RouteContext {
    /// Transaction of the STUN client's outstanding binding request
    pub(crate) outstanding: Option<u128>,
    pub(crate) session_active: bool,
    /// Engine index of the local candidate the datagram is attributed to
    pub(crate) attributed: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    StunClient,
    Engine { candidate: usize },
    Application,
    Drop(&'static str),
}

pub(crate) fn classify(data: &[u8], ctx: &RouteContext) -> Route {
    if !is_stun_message(data) {
        return Route::Application;
    }

    if let Some(outstanding) = ctx.outstanding {
        if let Ok((mtype, transaction)) = parse_header(data) {
            if mtype.is_response() && transaction == outstanding {
                return Route::StunClient;
            }
        }
    }

    if ctx.session_active {
        return match ctx.attributed {
            Some(candidate) => Route::Engine { candidate },
            None => Route::Drop("no local candidate in the session"),
        };
    }
    Route::Drop("STUN message without a session")
}
