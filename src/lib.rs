//! livephoto-cleaner replaces Live Photos with still-image copies.
//!
//! Selected Live Photos are processed in bounded batches: the still-image
//! resources of each batch are collected, copies are written back in one
//! library transaction (keeping album membership), the originals are
//! optionally deleted and the batch is recorded in a ledger so later runs
//! skip it.

#![warn(clippy::all)]

pub mod albums;
pub mod cli;
pub mod collector;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod library;
pub mod retry;
pub mod scanner;
pub mod settings;
pub mod shutdown;
pub mod types;
