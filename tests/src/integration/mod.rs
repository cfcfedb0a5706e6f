//! # Integration Tests
//!
//! Full sessions through [`mqtt_proxy::Listener`] with in-memory identity
//! and bus doubles.

pub mod harness;

mod flows;
