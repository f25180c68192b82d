// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Internal logging macros. Each one forwards to the [`log`](https://docs.rs/log)
//! crate when the `log` feature is enabled, and compiles to nothing otherwise.

#[cfg(feature = "log")]
macro_rules! log_debug {
    ( $($args:tt)* ) => {
        log::debug!( $($args)* )
    }
}

#[cfg(not(feature = "log"))]
macro_rules! log_debug {
    ( $($args:tt)* ) => {
        ()
    };
}

#[cfg(feature = "log")]
macro_rules! log_error {
    ( $($args:tt)* ) => {
        log::error!( $($args)* )
    }
}

#[cfg(not(feature = "log"))]
macro_rules! log_error {
    ( $($args:tt)* ) => {
        ()
    };
}

#[cfg(feature = "log")]
macro_rules! log_warn {
    ( $($args:tt)* ) => {
        log::warn!( $($args)* )
    }
}

#[cfg(not(feature = "log"))]
macro_rules! log_warn {
    ( $($args:tt)* ) => {
        ()
    };
}

#[cfg(all(feature = "log_parallelism", feature = "log"))]
macro_rules! log_info {
    ( $($args:tt)* ) => {
        log::info!( $($args)* )
    }
}

#[cfg(all(feature = "log_parallelism", not(feature = "log")))]
macro_rules! log_info {
    ( $($args:tt)* ) => {
        ()
    };
}

#[cfg(all(feature = "log_parallelism", feature = "log"))]
macro_rules! log_trace {
    ( $($args:tt)* ) => {
        log::trace!( $($args)* )
    }
}

#[cfg(all(feature = "log_parallelism", not(feature = "log")))]
macro_rules! log_trace {
    ( $($args:tt)* ) => {
        ()
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
#[cfg(feature = "log_parallelism")]
pub(crate) use log_info;
#[cfg(feature = "log_parallelism")]
pub(crate) use log_trace;
pub(crate) use log_warn;
