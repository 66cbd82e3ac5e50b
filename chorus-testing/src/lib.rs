//! Testing utilities for the Chorus protocol: in-memory coordinators and
//! replicas, and a scripted peer for driving the wire protocol by hand.

pub mod harness;

pub use harness::{init_tracing, ScriptedPeer, TestCoordinator, TestReplica, INIT_LIMIT, TICK};
