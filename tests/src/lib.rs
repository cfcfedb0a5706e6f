//! # Channel Proxy Test Suite
//!
//! End-to-end tests that run the real listener over loopback TCP, between
//! scripted MQTT clients and a scripted backend broker.
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── src/integration/
//! │   ├── harness.rs    # Scripted broker, proxy fixture, test client
//! │   └── flows.rs      # Connect / subscribe / publish / teardown flows
//! └── benches/          # Codec and delivery queue benchmarks
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p proxy-tests
//! cargo bench -p proxy-tests
//! ```

pub mod integration;
