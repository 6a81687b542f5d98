//! Live sales tracker for livestream shopping broadcasts.
//!
//! Detects the active livestream, walks its sold-items feed, keeps gross and
//! fee-adjusted totals, and pushes them to the overlay and popup surfaces.

pub mod aggregate;
pub mod config;
pub mod dashboard;
pub mod display;
pub mod resolver;
pub mod shop;
pub mod store;
pub mod sync;
pub mod tracker;
