//! Fuzzing harnesses for memif connections.
//!
//! `chain_model` exercises segmentation and reassembly as pure functions.
//! `link_model` drives a real master/slave pair over the in-memory transport
//! and checks every observable outcome against a model of what should have
//! happened.

pub mod chain_model;
pub mod link_model;
