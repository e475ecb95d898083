//! Core crate wiring together the UMID blockchain runtime.
//!
//! Consensus authority comes from identity binding: a node may propose
//! blocks only after an on-chain record binds its address to a hash of
//! its local machine identifier, and every sealed header carries an
//! authorization code derived from that binding. The `chain` module
//! holds the block engine, `state` the journaled account overlay,
//! `umid` the binding and stake rules, and `sync` the peer protocol
//! over the `bus`/`network` plumbing.
//!
//! Applications typically depend on [`config::NodeConfig`] to bootstrap
//! a node, [`node::Node`] and [`node::NodeHandle`] to operate it, and
//! [`api`] for the HTTP surface.

pub mod api;
pub mod bus;
pub mod chain;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod network;
pub mod node;
pub mod state;
pub mod storage;
pub mod sync;
pub mod txpool;
pub mod types;
pub mod umid;
