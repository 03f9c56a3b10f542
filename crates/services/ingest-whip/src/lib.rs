//! WHIP Ingest Gateway
//!
//! Accepts WebRTC publishers over WHIP and turns every session into one
//! MPEG-TS byte stream handed to a [`consumer::StreamConsumer`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                         whip-mpegts-server                            │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐                                                 │
//! │  │  HTTP API        │ ← POST /        (offer → answer, Location)     │
//! │  │  (axum)          │ ← PATCH /:id    DELETE /:id                    │
//! │  └────────┬─────────┘                                                 │
//! │           ▼                                                           │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌───────────────────┐  │
//! │  │  SessionManager  │──▶│  PeerFactory     │──▶│  TrackBarrier     │  │
//! │  │  (sessions map)  │   │  (webrtc-rs)     │   │  (N tracks)       │  │
//! │  └────────┬─────────┘   └──────────────────┘   └─────────┬─────────┘  │
//! │           │                                              ▼            │
//! │           │                               ┌──────────────────────────┐│
//! │           └──────── StreamConsumer ◀──────│ SynchronizedMuxer (TS)   ││
//! │                                           └──────────────────────────┘│
//! └───────────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod session;

pub use error::{Error, Result};
