//! Round lifecycle and live scoring service for match-day predictions.

pub mod api;
pub mod constants;
pub mod db;
pub mod engine;
pub mod util;
