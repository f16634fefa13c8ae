//! # mylocations
//!
//! Finds out where the device is and what street address is there.
//!
//! The decision making lives in [`controller::LocationController`], a small
//! state machine that is fed position fixes, provider errors, geocoding results
//! and timeouts, and answers with commands for the outside world plus a
//! [`view::ViewState`] to render. [`session::SessionDriver`] runs it on a tokio
//! task against pluggable providers.
//!
//! ## Features
//!
//! - Keeps the most accurate fresh fix of a session
//! - Stops on reaching the desired accuracy, when fixes stop improving, on
//!   errors or after a timeout
//! - Reverse geocodes the best fix with at most one lookup in flight
//! - Replays recorded provider tracks or simulates fixes from the command line

pub mod config;
pub mod controller;
pub mod error;
pub mod fix;
pub mod geocode;
pub mod provider;
pub mod session;
pub mod view;
