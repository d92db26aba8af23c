//! Coordination service: object locks, presence, the sequenced stream event log and its live
//! SSE fan-out.

pub mod api;
pub mod app;
pub mod auth;
pub mod broadcast;
pub mod clock;
pub mod config;
pub mod cors;
pub mod db;
pub mod error;
pub mod locks;
pub mod membership;
pub mod presence;
pub mod sse;
pub mod streams;
pub mod sweeper;
