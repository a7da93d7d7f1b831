//! Property and scenario test suite for the cairn engine.
//!
//! Integration tests live under `tests/` and exercise the engine through its
//! public API only: selection invariants, change non-reuse, derivation
//! determinism, PSBT interchange and the end-to-end send paths.

pub mod helpers;
