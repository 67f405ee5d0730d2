//! Core library for nkudo.
//!
//! Contains the tenant-scoped certificate authority, enrollment and
//! refresh-token secret handling, the microVM and plan state machines,
//! and the wire types shared between the control plane and the edge
//! agent. This crate knows nothing about HTTP transport or storage —
//! both sides depend on it for the domain rules.

pub mod error;
pub mod microvm;
pub mod pki;
pub mod plan;
pub mod secrets;
pub mod wire;
