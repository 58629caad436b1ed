//! Scribeflow Ingest — chunk planning and content fingerprinting.

pub mod chunking;
pub mod fingerprint;

pub use chunking::{effective_chunk_seconds, estimate_tokens, plan_chunks, plan_for_asset};
pub use fingerprint::{fingerprint_bytes, fingerprint_file};
