//! Reservation and loyalty-ledger settlement engine
//!
//! Books finite inventory, prices it, spends and restores loyalty coins, and
//! reconciles the services and users stores through a saga with background
//! sweeps.

pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod payments;
pub mod services;
pub mod workers;
