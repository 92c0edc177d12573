//! SMS Screener: inbound SMS router and questionnaire session engine.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod instruments;
pub mod results;
pub mod session;
pub mod store;
pub mod web;
