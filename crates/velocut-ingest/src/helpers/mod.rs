// crates/velocut-ingest/src/helpers/mod.rs
//
// Internal helper modules for velocut-ingest. Not re-exported from lib.rs —
// implementation details, not part of the public API.

pub mod seek;
