//! Cluster membership and request routing for a group of peer nodes.
//!
//! Nodes find out about each other and about failures through a SWIM-style
//! gossip protocol: every protocol period a node pings one member, asks a
//! few others to ping it indirectly if it does not answer, and suspects it
//! if nobody can reach it. Suspects that do not refute the suspicion in time
//! are declared faulty. Membership changes ride along on protocol messages
//! until every node has seen them.
//!
//! Members that are alive or suspect own positions on a consistent hash
//! ring, which [`Cluster::lookup`] and [`Cluster::lookup_n`] use to map keys
//! to nodes.
//!
//! Messages travel through a [`transport::Channel`]; the crate does not open
//! sockets itself.

mod admin;
pub mod cluster;
pub mod config;
pub mod error;
pub mod membership;
pub mod ring;
pub mod swim;
pub mod testkit;
pub mod transport;

#[rustfmt::skip]
pub use {
  cluster::Cluster,
  config::SwimConfig,
  error::SwimError,
  error::TransportError,
};
