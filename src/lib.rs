//! # Shelf Insight
//!
//! A local-first reading-history analyzer.
//!
//! Shelf Insight imports a reading-history CSV export, enriches each book
//! from the Open Library catalog, embeds and clusters the library by
//! similarity, and asks an LLM for narrative insights about the reader.
//! Everything is stored in a single SQLite file and exposed through a CLI
//! and a JSON HTTP API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌──────────┐
//! │ CSV      │──▶│ Enrich   │──▶│ Embed +   │──▶│  SQLite  │
//! │ import   │   │ (catalog)│   │ cluster   │   │          │
//! └──────────┘   └──────────┘   └───────────┘   └────┬─────┘
//!                                                    │
//!                  ┌──────────────────┬──────────────┤
//!                  ▼                  ▼              ▼
//!             ┌──────────┐      ┌──────────┐   ┌──────────┐
//!             │ Insights │      │   CLI    │   │   HTTP   │
//!             │  (LLM)   │      │ (shelf)  │   │  (axum)  │
//!             └──────────┘      └──────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! shelf init                          # create database
//! shelf import ./goodreads.csv        # import an export
//! shelf enrich                        # fetch descriptions and subjects
//! shelf embed && shelf cluster        # group similar books
//! shelf insights quick                # ask the LLM for a roast
//! shelf serve                         # start HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Error categories surfaced to users |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] / [`migrate`] | SQLite pool and schema |
//! | [`models`] / [`books`] | Book records and read queries |
//! | [`ingest`] | CSV parsing, normalization, dedup upsert |
//! | [`enrich`] | Catalog lookups with bounded concurrency |
//! | [`embedding`] | Embedding providers and the embedding pass |
//! | [`cluster`] | K-means, silhouette, PCA projection |
//! | [`stats`] | Aggregate reading statistics |
//! | [`prompts`] | Prompt templates and rendering |
//! | [`llm`] | LLM clients |
//! | [`insights`] / [`history`] | Insight generation and its record |
//! | [`server`] | HTTP API |

pub mod books;
pub mod cluster;
pub mod config;
pub mod db;
pub mod embedding;
pub mod enrich;
pub mod error;
pub mod history;
mod http;
pub mod ingest;
pub mod insights;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod prompts;
pub mod server;
pub mod stats;
