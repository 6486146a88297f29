//! Mock platform adapters and an in-process HTTP server shared by this
//! crate's scenario tests (see `tests/scenarios.rs`), mirroring the
//! teacher's mock-HAL test-support crate.

pub mod http_mock;
pub mod mocks;
