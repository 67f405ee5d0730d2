//! Control-plane services.
//!
//! Each service is a module of free functions over [`crate::state::AppState`]
//! implementing one closed-loop concern: enrollment, heartbeat + plan
//! leasing, plan application, and log ingest. Routes stay thin — they
//! authenticate, deserialize, and delegate here.

pub mod enrollment;
pub mod heartbeat;
pub mod logs;
pub mod plans;
