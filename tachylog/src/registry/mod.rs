//! # Registry
//!
//! Append-only tables that turn static call-site data into the small integer
//! references stored in record headers.
//!
//! - **Metadata**: one entry per call site. Ids are assigned on first use and
//!   cached inside the [`Metadata`] itself.
//! - **Format functions**: one decode routine per argument-list signature, keyed
//!   by the signature's `TypeId`. Frontends keep a small thread-local cache so the
//!   shared table is only locked on a miss.
//!
//! Id `0` is reserved in both tables for "none".
//!
//! The backend never locks on the hot path either: it reads through
//! [`MetadataCache`] and [`FormatCache`], local snapshots that only go back to
//! the shared tables when they meet an id they have not seen yet.


use std::any::TypeId;
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};
use std::sync::atomic::Ordering;
use std::sync::{OnceLock, PoisonError, RwLock};

use crate::codec::{DecodeArgsFn, EncodeArgs};
use crate::record::Metadata;

/// FNV-1a, eight bytes at a time.
#[derive(Default)]
pub struct FnvHasher {
  hash: u64,
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

impl Hasher for FnvHasher {
  #[inline]
  fn write(&mut self, bytes: &[u8]) {
    let mut hash = if self.hash == 0 { FNV_OFFSET } else { self.hash };

    let chunks = bytes.chunks_exact(8);
    let remainder = chunks.remainder();
    for chunk in chunks {
      let mut word = [0u8; 8];
      word.copy_from_slice(chunk);
      hash ^= u64::from_ne_bytes(word);
      hash = hash.wrapping_mul(FNV_PRIME);
    }
    for &byte in remainder {
      hash ^= byte as u64;
      hash = hash.wrapping_mul(FNV_PRIME);
    }

    self.hash = hash;
  }

  #[inline]
  fn finish(&self) -> u64 {
    self.hash
  }
}

pub type FnvBuildHasher = BuildHasherDefault<FnvHasher>;

#[derive(Default)]
struct FormatTable {
  ids: HashMap<TypeId, u32, FnvBuildHasher>,
  // index 0 is the "no arguments" slot
  functions: Vec<Option<DecodeArgsFn>>,
}

fn metadata_table() -> &'static RwLock<Vec<&'static Metadata>> {
  static TABLE: OnceLock<RwLock<Vec<&'static Metadata>>> = OnceLock::new();
  TABLE.get_or_init(|| RwLock::new(Vec::with_capacity(1024)))
}

fn format_table() -> &'static RwLock<FormatTable> {
  static TABLE: OnceLock<RwLock<FormatTable>> = OnceLock::new();
  TABLE.get_or_init(|| {
    RwLock::new(FormatTable {
      ids: HashMap::default(),
      functions: vec![None],
    })
  })
}

/// Assigns an id to `metadata`, or returns the one another thread assigned first.
#[cold]
pub(crate) fn register_metadata(metadata: &'static Metadata) -> u32 {
  let mut table = metadata_table().write().unwrap_or_else(PoisonError::into_inner);

  // Double-check: another thread may have won the race for this call site
  let existing = metadata.id_slot().load(Ordering::Acquire);
  if existing != 0 {
    return existing;
  }

  table.push(metadata);
  let id = table.len() as u32;
  metadata.id_slot().store(id, Ordering::Release);
  id
}

/// Small round-robin cache of `TypeId -> id` pairs, private to each thread.
struct LocalCache {
  entries: [(Option<TypeId>, u32); 16],
  counter: u8,
}

impl LocalCache {
  const fn new() -> Self {
    Self {
      entries: [(None, 0); 16],
      counter: 0,
    }
  }

  #[inline]
  fn get(&self, key: TypeId) -> Option<u32> {
    self
      .entries
      .iter()
      .find(|(k, _)| *k == Some(key))
      .map(|(_, id)| *id)
  }

  fn put(&mut self, key: TypeId, id: u32) {
    let idx = self.counter as usize % 16;
    self.entries[idx] = (Some(key), id);
    self.counter = self.counter.wrapping_add(1);
  }
}

thread_local! {
  static LOCAL_CACHE: UnsafeCell<LocalCache> = const { UnsafeCell::new(LocalCache::new()) };
}

/// Id of the decode routine for argument lists shaped like `A`.
#[inline]
pub fn format_id<A: EncodeArgs>() -> u32 {
  let key = TypeId::of::<A::Signature>();

  LOCAL_CACHE.with(|cache| {
    let cache = cache.get();
    // SAFETY: the cache is thread-local and no reference to it outlives this closure
    if let Some(id) = unsafe { (*cache).get(key) } {
      return id;
    }

    let id = register_format(key, A::decode_args);
    unsafe { (*cache).put(key, id) };
    id
  })
}

#[cold]
fn register_format(key: TypeId, decode: DecodeArgsFn) -> u32 {
  if let Some(&id) = format_table()
    .read()
    .unwrap_or_else(PoisonError::into_inner)
    .ids
    .get(&key)
  {
    return id;
  }

  let mut table = format_table().write().unwrap_or_else(PoisonError::into_inner);
  if let Some(&id) = table.ids.get(&key) {
    return id;
  }

  let id = table.functions.len() as u32;
  table.functions.push(Some(decode));
  table.ids.insert(key, id);
  id
}

/// Backend-side snapshot of the metadata table.
#[derive(Default)]
pub struct MetadataCache {
  local: Vec<&'static Metadata>,
}

impl MetadataCache {
  pub fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub fn get(&mut self, id: u32) -> Option<&'static Metadata> {
    if id == 0 {
      return None;
    }
    let index = id as usize - 1;
    if index >= self.local.len() {
      self.refresh();
    }
    self.local.get(index).copied()
  }

  #[cold]
  fn refresh(&mut self) {
    let table = metadata_table().read().unwrap_or_else(PoisonError::into_inner);
    self.local.extend_from_slice(&table[self.local.len()..]);
  }
}

/// Backend-side snapshot of the format function table.
#[derive(Default)]
pub struct FormatCache {
  local: Vec<Option<DecodeArgsFn>>,
}

impl FormatCache {
  pub fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub fn get(&mut self, id: u32) -> Option<DecodeArgsFn> {
    let index = id as usize;
    if index >= self.local.len() {
      self.refresh();
    }
    self.local.get(index).copied().flatten()
  }

  #[cold]
  fn refresh(&mut self) {
    let table = format_table().read().unwrap_or_else(PoisonError::into_inner);
    self.local.extend_from_slice(&table.functions[self.local.len()..]);
  }
}
