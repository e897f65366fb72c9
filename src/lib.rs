#![forbid(unsafe_code)]

//! Public entry point for the tubefetch crate.
//!
//! The library holds everything the `backend` binary wires together: the
//! account ledger, session registry, download coordinator, retrieval store and
//! the HTTP router on top of them.

pub mod account;
pub mod api;
pub mod config;
pub mod jobs;
pub mod media;
pub mod quality;
pub mod resolver;
pub mod retrieval;
pub mod security;
pub mod session;
pub mod transcode;
