//! negotiation-narrator: client-side viewer for a remote negotiation session.
//!
//! Polls the broker's transcript endpoint for incremental updates and
//! narrates newly arrived lines with synthesized speech, tracking a
//! "currently speaking" index for UI highlighting.

pub mod config;
pub mod narrator;
pub mod poller;
pub mod remote;
pub mod store;
