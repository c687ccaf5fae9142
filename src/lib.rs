//! # Smsgate - SMS Gateway for Serial GSM Modems
//!
//! Smsgate drives one or more GSM modems attached over serial ports. It accepts
//! outbound message requests, dispatches them across the available modems with
//! retry and persistence, and periodically polls the modems for inbound messages
//! which it persists and can forward as email.
//!
//! ## Features
//!
//! - **AT Modem Driver**: Request/response state machine over an 8-N-1 serial line,
//!   including UCS-2 hex text encoding and concatenated (multi-part) submission.
//! - **Persistent Dispatch**: SQLite-backed outbound queue with a low-water-mark
//!   loader, randomized device selection, and a bounded retry policy.
//! - **Inbound Polling**: Periodic `AT+CMGL` sweeps with read-then-delete semantics.
//! - **Email Forwarding**: Optional SMTP notifier invoked once per persisted
//!   incoming message.
//! - **Async Design**: Built with Tokio; one cooperating worker task per modem.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smsgate::config::Config;
//! use smsgate::gateway::Gateway;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let gateway = Gateway::start(&config).await?;
//!
//!     gateway.send_message("", "+15551234567", "hello from the gateway").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`gateway`] - Dispatch engine: device workers, queue loader, enqueue API
//! - [`modem`] - AT driver, serial transport, text codec, `+CMGL` parsing
//! - [`storage`] - SQLite persistence for outbound and inbound messages
//! - [`notify`] - Incoming-message notifier contract and SMTP implementation
//! - [`config`] - Configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Gateway      │ ← enqueue API, dispatcher, loader
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Device Worker  │ ← one task per modem, serialized AT access
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Modem Driver   │ ← AT state machine over serial
//! └─────────────────┘
//! ```

pub mod config;
pub mod gateway;
pub mod logutil;
pub mod modem;
pub mod notify;
pub mod storage;
