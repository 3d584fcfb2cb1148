//! Test support
//!
//! A small key/value protocol and an in-memory store, used by the unit and
//! integration tests and handy for embedding the replication core in examples.

pub mod kv;
