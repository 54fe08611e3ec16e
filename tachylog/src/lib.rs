//! # tachylog
//!
//! Asynchronous low-latency logging. Producer threads encode the raw bytes of
//! their arguments into a per-thread SPSC queue; a single backend thread drains
//! every queue, formats records, merges them in timestamp order and hands them
//! to sinks.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tachylog::{BackendOptions, Engine, StdoutSink};
//!
//! let engine = Engine::global();
//! engine.start_backend(BackendOptions::default())?;
//!
//! let logger = engine.create_or_get_logger("app", vec![Arc::new(StdoutSink::text())]);
//! tachylog::info!(logger, "started with {} workers", 8u32);
//!
//! logger.flush();
//! engine.stop_backend();
//! ```

extern crate self as tachylog;

mod macros;
mod backend;
pub mod backtrace;
pub mod bounded_queue;
pub mod clock;
pub mod codec;
pub mod engine;
pub mod error;
pub mod level;
pub mod logger;
pub mod message_format;
pub mod options;
pub mod record;
pub mod registry;
pub mod ring_storage;
pub mod sink;
pub mod stdout_sink;
pub mod thread_context;
pub mod trace_layer;
pub mod transit;
pub mod unbounded_queue;
pub mod utils;

pub use backend::BackendState;
pub use clock::ClockSource;
pub use engine::Engine;
pub use error::{Error, Result};
pub use level::LogLevel;
pub use logger::Logger;
pub use options::{BackendOptions, FrontendOptions, QueueType};
pub use record::Metadata;
pub use sink::{ChannelSink, ErrorNotifier, LogRecord, OwnedRecord, Sink};
pub use stdout_sink::{StdoutFormat, StdoutSink};
pub use tachylog_macros::Codec;
pub use trace_layer::TachylogLayer;
