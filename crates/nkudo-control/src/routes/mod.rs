//! HTTP routes for the control plane.
//!
//! Route modules stay thin: authenticate, deserialize, delegate to the
//! service layer, serialize. Routers are nested and layered in
//! `main.rs`.

pub mod admin;
pub mod agent;
pub mod enroll;
pub mod pki;
