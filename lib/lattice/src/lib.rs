//! `lattice` is a framework for asynchronous distributed client/server
//! systems: a fixed set of data-serving nodes and a client that fans
//! requests out to them over a connection-oriented, multiplexed,
//! length-prefixed, HMAC-authenticated wire protocol.
//!
//! The moving parts, bottom-up: framing and typed payload parsing
//! ([`frame`], [`parse`]), the authentication handshake ([`auth`]), one
//! [`connection`] per node with reconnect backoff, the per-(request,
//! connection) fiber fabric ([`fiber`]), the request skeletons and
//! node-side suspendable streaming ([`request`]), and the two drive loops:
//! [`client::Client`] and [`node::NodeEndpoint`]. Everything runs on one
//! OS thread; fibers are resumable state machines multiplexed over a mio
//! poll.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod auth;
pub mod buffer;
pub mod client;
pub mod config;
pub mod connection;
pub mod fiber;
pub mod frame;
pub mod link;
pub mod node;
pub mod parse;
pub mod registry;
pub mod request;
pub mod shared;
pub mod stats;
pub mod timeouts;
pub mod tracker;
