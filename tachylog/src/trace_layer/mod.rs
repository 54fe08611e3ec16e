//! # Trace Layer
//!
//! Routes `tracing` events into a tachylog [`Logger`], so code instrumented with
//! `tracing` macros gets the same queues, ordering and sinks as direct calls.
//!
//! Each `tracing` callsite is mapped once to a static [`Metadata`] whose format
//! is `"{}"` for the message plus a ` name={name}` placeholder per other field.
//! Field values therefore reach sinks both in the message and as named
//! arguments.
//!
//! Events raised on a backend thread and events under the `tachylog` target are
//! ignored.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tracing_subscriber::layer::SubscriberExt;
//!
//! let logger = engine.create_or_get_logger("tracing", vec![Arc::new(StdoutSink::json())]);
//! let subscriber = tracing_subscriber::Registry::default().with(TachylogLayer::new(logger));
//! tracing::subscriber::set_global_default(subscriber)?;
//!
//! tracing::info!(order_id = 42, "order accepted");
//! ```


use std::collections::HashMap;
use std::fmt::Write;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::callsite::Identifier;
use tracing::field::{Field, Visit};
use tracing::{Event as TracingEvent, Level, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

use crate::codec::{ArgList, Codec, Decoder, EncodeArgs, Encoder};
use crate::error::Result;
use crate::level::LogLevel;
use crate::logger::{is_backend_thread, Logger};
use crate::record::Metadata;
use crate::registry::FnvBuildHasher;

/// Maps a `tracing` level onto the closest tachylog level.
pub fn map_level(level: &Level) -> LogLevel {
  match *level {
    Level::TRACE => LogLevel::TraceL1,
    Level::DEBUG => LogLevel::Debug,
    Level::INFO => LogLevel::Info,
    Level::WARN => LogLevel::Warning,
    Level::ERROR => LogLevel::Error,
  }
}

/// Field values of one event, in callsite field order with the message first.
pub struct FieldValues(pub Vec<String>);

impl EncodeArgs for FieldValues {
  type Signature = FieldValues;

  fn encoded_size(&self) -> usize {
    4 + self.0.iter().map(|v| v.encoded_size()).sum::<usize>()
  }

  fn encode(&self, encoder: &mut Encoder<'_>) {
    encoder.put_u32(self.0.len() as u32);
    for value in &self.0 {
      value.encode(encoder);
    }
  }

  fn decode_args<'a>(decoder: &mut Decoder<'a>, out: &mut ArgList<'a>) -> Result<()> {
    let count = decoder.u32()?;
    for _ in 0..count {
      out.push(<str as Codec>::decode_arg(decoder)?);
    }
    Ok(())
  }
}

/// Per-callsite layout: the leaked metadata and where each field goes.
struct CallsiteLayout {
  metadata: &'static Metadata,
  /// Value slot of each callsite field, by field name.
  slots: Vec<(&'static str, usize)>,
  values: usize,
}

#[derive(Clone)]
pub struct TachylogLayer {
  logger: Arc<Logger>,
  callsites: Arc<RwLock<HashMap<Identifier, Arc<CallsiteLayout>, FnvBuildHasher>>>,
}

impl std::fmt::Debug for TachylogLayer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TachylogLayer")
      .field("logger", &self.logger.name())
      .finish()
  }
}

impl TachylogLayer {
  pub fn new(logger: Arc<Logger>) -> Self {
    Self {
      logger,
      callsites: Arc::new(RwLock::new(HashMap::default())),
    }
  }

  pub fn logger(&self) -> &Arc<Logger> {
    &self.logger
  }

  fn layout(&self, metadata: &'static tracing::Metadata<'static>) -> Arc<CallsiteLayout> {
    let id = metadata.callsite();
    if let Some(layout) = self
      .callsites
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(&id)
    {
      return Arc::clone(layout);
    }

    let mut callsites = self.callsites.write().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(callsites.entry(id).or_insert_with(|| Arc::new(build_layout(metadata))))
  }
}

/// Leaks one [`Metadata`] per `tracing` callsite; callsites are static so the
/// total is bounded.
fn build_layout(metadata: &'static tracing::Metadata<'static>) -> CallsiteLayout {
  let mut format = String::from("{}");
  let mut slots = Vec::with_capacity(metadata.fields().len());
  let mut values = 1;

  for field in metadata.fields().iter() {
    if field.name() == "message" {
      slots.push((field.name(), 0));
    } else {
      let placeholder: String = field
        .name()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
      let _ = write!(format, " {}={{{}}}", field.name(), placeholder);
      slots.push((field.name(), values));
      values += 1;
    }
  }

  let format: &'static str = Box::leak(format.into_boxed_str());
  let leaked: &'static Metadata = Box::leak(Box::new(Metadata::new(
    format,
    metadata.file().unwrap_or("<unknown>"),
    metadata.line().unwrap_or(0),
    metadata.module_path().unwrap_or(metadata.target()),
    map_level(metadata.level()),
  )));

  CallsiteLayout {
    metadata: leaked,
    slots,
    values,
  }
}

impl<S> Layer<S> for TachylogLayer
where
  S: Subscriber + for<'a> LookupSpan<'a>,
{
  fn on_event(&self, event: &TracingEvent<'_>, _ctx: Context<'_, S>) {
    let metadata = event.metadata();
    if is_backend_thread() || metadata.target() == "tachylog" {
      return;
    }
    if !self.logger.should_log(map_level(metadata.level())) {
      return;
    }

    let layout = self.layout(metadata);
    let mut visitor = FieldVisitor {
      slots: &layout.slots,
      values: vec![String::new(); layout.values],
    };
    event.record(&mut visitor);

    self.logger.log(layout.metadata, FieldValues(visitor.values));
  }
}

struct FieldVisitor<'a> {
  slots: &'a [(&'static str, usize)],
  values: Vec<String>,
}

impl FieldVisitor<'_> {
  fn slot(&mut self, field: &Field) -> Option<&mut String> {
    let name = field.name();
    let (_, slot) = self.slots.iter().find(|(slot_name, _)| *slot_name == name)?;
    self.values.get_mut(*slot)
  }
}

impl Visit for FieldVisitor<'_> {
  fn record_str(&mut self, field: &Field, value: &str) {
    if let Some(slot) = self.slot(field) {
      slot.push_str(value);
    }
  }

  fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
    if let Some(slot) = self.slot(field) {
      let _ = write!(slot, "{:?}", value);
    }
  }
}
