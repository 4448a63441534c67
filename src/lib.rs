//! # testbrain
//!
//! Documentation-grounded test case and browser-automation script
//! generation.
//!
//! testbrain ingests heterogeneous documents (markdown, text, JSON, PDF,
//! HTML) plus a target page's markup, builds an in-memory vector knowledge
//! base, and uses a text-generation backend to produce test cases that cite
//! the documents they came from, then Selenium or Playwright scripts that
//! only touch selectors present on the page.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────┐   ┌──────────────┐
//! │ Normalizer │──▶│ Chunker │──▶│ Indexer (KB) │  build phase
//! └────────────┘   └─────────┘   └──────┬───────┘
//!       │ markup                        │ retrieve
//!       ▼                               ▼
//! ┌────────────┐               ┌──────────────────┐   ┌─────────┐
//! │ ElementMap │──────────────▶│ Generator        │◀─▶│ Backend │
//! └────────────┘               │ Synthesizer      │   │ Adapter │
//!                              └──────────────────┘   └─────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`normalize`] | Multi-format normalization |
//! | [`elements`] | Element map extraction |
//! | [`selectors`] | Selector extraction and validation |
//! | [`embedding`] | Embedding providers |
//! | [`backend`] | Generation backends, retry, timeouts |
//! | [`index`] | Knowledge-base build, swap, and retrieval |
//! | [`prompts`] | Prompt templates |
//! | [`generator`] | Grounded test-case generation |
//! | [`synthesizer`] | Script synthesis |
//! | [`session`] | Session façade and stores |
//! | [`loader`] | Filesystem document loader |
//!
//! Data models, chunking, and ranking live in [`testbrain_core`].

pub mod backend;
pub mod config;
pub mod elements;
pub mod embedding;
pub mod error;
pub mod generator;
pub mod index;
pub mod loader;
pub mod normalize;
pub mod prompts;
pub mod selectors;
pub mod session;
pub mod synthesizer;

pub use testbrain_core::models;
