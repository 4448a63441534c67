//! # testbrain core
//!
//! Shared, I/O-free logic for testbrain: data models, chunking, the
//! embedding trait, similarity ranking, and immutable knowledge-base
//! snapshots.
//!
//! This crate contains no tokio, network, or filesystem dependencies.
//! Document parsing, embedding providers, and text-generation backends live
//! in the `testbrain` app crate.

pub mod chunk;
pub mod embedding;
pub mod knowledge;
pub mod models;
pub mod search;
