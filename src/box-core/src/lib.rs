//! Core library for the box-scanner service.
//!
//! Provides the shared scanning pipeline:
//! - Flat dotted-path configuration store backed by TOML
//! - Rate-limited HTTP transport to the broker's market-data API
//! - Instrument universe caching and quote retrieval
//! - Expiry classification, box pricing, margin/risk, and combination
//!   evaluation
//! - A small OS-thread worker pool used for CPU-bound fan-out
//! - Execution sinks (paper trading / stub broker) consuming ranked output

pub mod auth;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod execution;
pub mod expiry;
pub mod http;
pub mod instrument_store;
pub mod models;
pub mod orchestrator;
pub mod pricing;
pub mod quote_fetcher;
pub mod rate_limiter;
pub mod risk;
pub mod worker_pool;

pub use auth::{CredentialProvider, StaticCredentialProvider};
pub use config::{Config, ConfigError};
pub use error::ScanError;
pub use evaluator::CombinationEvaluator;
pub use execution::{ExecutionSink, NullBrokerSink, PaperTradingSink, RoutingSummary, SinkError};
pub use expiry::{ExpiryClass, ExpiryClassifier};
pub use http::{HttpResponse, HttpTransport, ReqwestTransport, TransportError};
pub use instrument_store::InstrumentStore;
pub use models::{
    BoxSpreadCandidate, DepthLadder, DepthLevel, Instrument, InstrumentKind, OptionKind,
};
pub use orchestrator::{ScanOrchestrator, ScanSummary};
pub use quote_fetcher::{OhlcSnapshot, QuoteFetcher};
pub use rate_limiter::RateLimiter;
pub use worker_pool::WorkerPool;
