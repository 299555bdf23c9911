//! Pipeline stages for page-by-page record extraction.
//!
//! Each submodule owns one concern; the orchestrator in [`crate::extract`]
//! wires them together per unit.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ schedule ──▶ retry(service) ──▶ normalize ──▶ sink
//! (URL/path) (pdfium)   (ticket)     (VLM + backoff)    (records)    (file)
//! ```
//!
//! 1. [`input`]     canonicalise the path or URL to a local file and hash it
//! 2. [`render`]    rasterise one page; runs in `spawn_blocking` because
//!    pdfium is not async-safe
//! 3. [`encode`]    PNG-encode and base64-wrap for the multimodal request
//! 4. [`schedule`]  admission: concurrency, rolling rate window, min spacing
//! 5. [`retry`]     error classification and exponential backoff
//! 6. [`service`]   the VLM call; the only stage with network I/O besides input
//! 7. [`normalize`] parse the reply and turn raw items into records
//! 8. [`sink`]      write the ordered dataset; keep the partial journal

pub mod encode;
pub mod input;
pub mod normalize;
pub mod render;
pub mod retry;
pub mod schedule;
pub mod service;
pub mod sink;
