//! Core of an anonymous overlay router: a distributed routing database
//! (netdb), a reliable byte-stream layer over anonymized messages, and the
//! tunnel-routed glue binding the two. Link transports, tunnel building and
//! the end-to-end encryption layer attach through the seams in [`tunnel`].

pub mod app;
pub mod config;
pub mod gzip;
pub mod i2np;
pub mod identity;
pub mod logging;
pub mod netdb;
pub mod queue;
pub mod streaming;
pub mod tunnel;
pub mod util;
