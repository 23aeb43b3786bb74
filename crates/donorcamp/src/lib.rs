//! donorcamp — a bulk email campaign engine for donor management.
//!
//! The engine takes a fundraiser's one-line instruction through a short
//! refinement dialogue, generates a personalized email per donor through
//! an external provider, holds everything for human review, then packs
//! approved emails into send slots under a per-organization daily cap and
//! dispatches them on a periodic tick.
//!
//! Hosts wire the pieces together around a shared [`db::Database`] and a
//! [`events::ChangeBroadcaster`], providing their own implementations of
//! the external seams: [`donor::DonorDirectory`],
//! [`generation::GenerationProvider`] and [`send::MailTransport`].

pub mod config;
pub mod db;
pub mod donor;
pub mod error;
pub mod events;
pub mod flow;
pub mod generation;
pub mod review;
pub mod sanitize;
pub mod schedule;
pub mod send;
pub mod session;

pub use config::EngineConfig;
pub use error::{DispatchError, EngineError, GenerationError, Result};
