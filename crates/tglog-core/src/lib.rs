//! Forward error log events to a Telegram chat.
//!
//! This crate is framework-agnostic. The Telegram Bot API client lives behind
//! [`messaging::port::MessagingPort`] and [`registration::ChatLookup`], implemented
//! in the adapter crate.

pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod layer;
pub mod logging;
pub mod messaging;
pub mod record;
pub mod registration;

pub use errors::{Error, Result};
