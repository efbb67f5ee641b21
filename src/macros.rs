//! Logging shims.
//!
//! Protocol events are interesting at two levels: ordinary progress (state
//! transitions, segments in and out) and the unusual (bad checksums, stray
//! segments, challenge ACKs). The macros forward to the `log` facade so the
//! host decides where the text ends up.

macro_rules! net_trace {
    ($($arg:tt)*) => { log::trace!($($arg)*) };
}

macro_rules! net_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}
