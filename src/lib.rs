//! Building blocks for catalogue pipeline components.
//!
//! Harvesters, transformers and ingesters implement a
//! [`Messager`](messagers::Messager) (usually through one of the catalogue
//! change handlers) and hand it to a [`Runner`](runner::Runner), which
//! subscribes to the broker, dispatches deliveries and acks or nacks them.

pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod humanize;
pub mod messagers;
pub mod observability;
pub mod runner;
pub mod storage;
