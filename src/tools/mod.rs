//! Supporting plumbing: sockets, log sinks and sampling helpers.

pub mod logging;
pub mod transport;
pub mod util;
