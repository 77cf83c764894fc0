//! Vocal-to-accompaniment generation in pure Rust.
//!
//! Takes a vocal recording and generates an instrumental accompaniment with
//! two autoregressive token transformers, built on candle. Loads safetensors
//! weights directly.
//!
//! ## Architecture
//!
//! ```text
//! vocal WAV → mono, first 10 s ─┬→ HuBERT + k-means ──→ semantic tokens ─┐
//!                               └→ EnCodec (3 levels) → coarse tokens ───┤
//!                                                                        ↓
//!                         Stage 1: semantic-from-vocal transformer
//!                                                                        ↓
//! prompt → CLAP text + RVQ → text tokens ──→ Stage 2: coarse transformer
//!                                                                        ↓
//!                                            EnCodec decode → instrumental WAV
//! ```
//!
//! ## Modules
//!
//! - [`audio`] — WAV I/O, resampling, request preprocessing
//! - [`model`] — HuBERT, EnCodec, CLAP, token transformer, weight loading
//! - [`extract`] — the three token extractors
//! - [`generation`] — token layouts, sampling, both generation stages
//! - [`pipeline`] — end-to-end request orchestration
//! - [`manager`] — shared models, bounded concurrency, async entry point
//! - [`server`] — HTTP endpoint
//! - [`archive`] — evaluation archive

pub mod archive;
pub mod audio;
pub mod config;
pub mod extract;
pub mod generation;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod request;
pub mod server;
pub mod tokens;

mod error;

pub use error::{Error, Result, Stage};
