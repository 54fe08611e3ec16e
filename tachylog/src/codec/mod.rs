//! # Codec
//!
//! How log arguments cross the thread boundary. Every argument type states how
//! many bytes it needs, writes exactly that many, and on the backend reads them
//! back into an [`Arg`] that is only formatted when a sink needs the message.
//!
//! ## Strategies
//!
//! - **Trivially copyable** (integers, floats, `bool`, `char`): the native bytes
//!   are copied, the backend rebuilds the value from them.
//! - **Variable length** (`str`, `String`, slices, `Vec`, `Option`): a `u32`
//!   length or tag prefix followed by the elements. Strings decode as a borrowed
//!   view into the queue.
//! - **User defined** (`#[derive(Codec)]` or a hand-written impl): members are
//!   encoded in declaration order and the reconstructed value is formatted
//!   lazily through its `Display` (or `Debug`) impl.
//!
//! ## Size exactness
//!
//! For any argument list `args`:
//! `args.encoded_size() == bytes written by encode == bytes consumed by decode_args`.
//! The backend has no other description of the argument types; it relies on the
//! per-signature [`DecodeArgsFn`] registered by the frontend.
//!
//! ```rust
//! use tachylog::codec::{ArgList, Decoder, Encoder, EncodeArgs};
//!
//! let args = (&42u32, &"answer");
//! let mut buf = vec![0u8; args.encoded_size()];
//! args.encode(&mut Encoder::new(&mut buf));
//!
//! let mut decoded = ArgList::new();
//! let mut decoder = Decoder::new(&buf);
//! <(&u32, &&str) as EncodeArgs>::decode_args(&mut decoder, &mut decoded).unwrap();
//! assert_eq!(decoder.position(), buf.len());
//! assert_eq!(decoded.len(), 2);
//! ```


use smallvec::SmallVec;
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;

use crate::error::{Error, Result};

/// Writes into a reserved queue region.
///
/// Writes past the end are dropped and flagged instead of panicking; the
/// frontend discards a record whose encoder overflowed.
pub struct Encoder<'a> {
  buf: &'a mut [u8],
  pos: usize,
  overflowed: bool,
}

impl<'a> Encoder<'a> {
  #[inline]
  pub fn new(buf: &'a mut [u8]) -> Self {
    Self {
      buf,
      pos: 0,
      overflowed: false,
    }
  }

  #[inline]
  pub fn put(&mut self, bytes: &[u8]) {
    let end = self.pos + bytes.len();
    match self.buf.get_mut(self.pos..end) {
      Some(dst) => {
        dst.copy_from_slice(bytes);
        self.pos = end;
      },
      None => self.overflowed = true,
    }
  }

  #[inline]
  pub fn put_u8(&mut self, value: u8) {
    self.put(&[value]);
  }

  #[inline]
  pub fn put_u32(&mut self, value: u32) {
    self.put(&value.to_ne_bytes());
  }

  #[inline]
  pub fn put_u64(&mut self, value: u64) {
    self.put(&value.to_ne_bytes());
  }

  #[inline]
  pub fn position(&self) -> usize {
    self.pos
  }

  /// True when every byte of the region was written and nothing overflowed.
  #[inline]
  pub fn is_exact(&self) -> bool {
    !self.overflowed && self.pos == self.buf.len()
  }
}

/// Reads a record back on the backend. Every read is bounds-checked.
pub struct Decoder<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> Decoder<'a> {
  #[inline]
  pub fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  #[inline]
  pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
    let end = self.pos + n;
    let bytes = self.buf.get(self.pos..end).ok_or_else(|| {
      Error::decode(format!(
        "record truncated: wanted {} bytes at offset {}, {} available",
        n,
        self.pos,
        self.buf.len()
      ))
    })?;
    self.pos = end;
    Ok(bytes)
  }

  #[inline]
  pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
    let bytes = self.take(N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
  }

  #[inline]
  pub fn u8(&mut self) -> Result<u8> {
    Ok(self.take_array::<1>()?[0])
  }

  #[inline]
  pub fn u32(&mut self) -> Result<u32> {
    Ok(u32::from_ne_bytes(self.take_array()?))
  }

  #[inline]
  pub fn u64(&mut self) -> Result<u64> {
    Ok(u64::from_ne_bytes(self.take_array()?))
  }

  #[inline]
  pub fn position(&self) -> usize {
    self.pos
  }

  #[inline]
  pub fn remaining(&self) -> usize {
    self.buf.len() - self.pos
  }
}

/// A decoded argument, ready to be rendered into a message.
pub enum Arg<'a> {
  Bool(bool),
  Char(char),
  I64(i64),
  U64(u64),
  I128(i128),
  U128(u128),
  F32(f32),
  F64(f64),
  Str(&'a str),
  List(Vec<Arg<'a>>),
  Opt(Option<Box<Arg<'a>>>),
  /// Formatted through `Display` only when rendered.
  Display(Box<dyn fmt::Display + 'a>),
  /// Formatted through `Debug` only when rendered.
  Debug(Box<dyn fmt::Debug + 'a>),
}

impl<'a> Arg<'a> {
  pub fn display<T: fmt::Display + 'a>(value: T) -> Self {
    Arg::Display(Box::new(value))
  }

  pub fn debug<T: fmt::Debug + 'a>(value: T) -> Self {
    Arg::Debug(Box::new(value))
  }
}

impl fmt::Debug for Arg<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Arg::Bool(v) => write!(f, "Bool({})", v),
      Arg::Char(v) => write!(f, "Char({:?})", v),
      Arg::I64(v) => write!(f, "I64({})", v),
      Arg::U64(v) => write!(f, "U64({})", v),
      Arg::I128(v) => write!(f, "I128({})", v),
      Arg::U128(v) => write!(f, "U128({})", v),
      Arg::F32(v) => write!(f, "F32({})", v),
      Arg::F64(v) => write!(f, "F64({})", v),
      Arg::Str(v) => write!(f, "Str({:?})", v),
      Arg::List(v) => f.debug_tuple("List").field(v).finish(),
      Arg::Opt(v) => f.debug_tuple("Opt").field(v).finish(),
      Arg::Display(v) => write!(f, "Display({})", v),
      Arg::Debug(v) => write!(f, "Debug({:?})", v),
    }
  }
}

/// Frontend and backend halves of one argument type.
pub trait Codec {
  /// `'static` stand-in for the type, used to key the decode routine of an
  /// argument list. Types that decode identically may share a signature.
  type Signature: ?Sized + 'static;

  fn encoded_size(&self) -> usize;

  fn encode(&self, encoder: &mut Encoder<'_>);

  fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>>;
}

/// Owned reconstruction, used for members of user-defined types.
pub trait Decode: Sized {
  fn decode(decoder: &mut Decoder<'_>) -> Result<Self>;
}

pub struct SeqOf<T: ?Sized>(PhantomData<T>);
pub struct ArrayOf<T: ?Sized, const N: usize>(PhantomData<T>);
pub struct OptionOf<T: ?Sized>(PhantomData<T>);

macro_rules! impl_numeric_codec {
  ($($ty:ty => $variant:ident($as:ty)),* $(,)?) => {
    $(
      impl Codec for $ty {
        type Signature = $ty;

        #[inline]
        fn encoded_size(&self) -> usize {
          size_of::<$ty>()
        }

        #[inline]
        fn encode(&self, encoder: &mut Encoder<'_>) {
          encoder.put(&self.to_ne_bytes());
        }

        #[inline]
        fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>> {
          Ok(Arg::$variant(<$ty as Decode>::decode(decoder)? as $as))
        }
      }

      impl Decode for $ty {
        #[inline]
        fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
          Ok(<$ty>::from_ne_bytes(decoder.take_array()?))
        }
      }
    )*
  };
}

impl_numeric_codec!(
  i8 => I64(i64),
  i16 => I64(i64),
  i32 => I64(i64),
  i64 => I64(i64),
  isize => I64(i64),
  u8 => U64(u64),
  u16 => U64(u64),
  u32 => U64(u64),
  u64 => U64(u64),
  usize => U64(u64),
  i128 => I128(i128),
  u128 => U128(u128),
  f32 => F32(f32),
  f64 => F64(f64),
);

impl Codec for bool {
  type Signature = bool;

  #[inline]
  fn encoded_size(&self) -> usize {
    1
  }

  #[inline]
  fn encode(&self, encoder: &mut Encoder<'_>) {
    encoder.put_u8(*self as u8);
  }

  fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>> {
    Ok(Arg::Bool(bool::decode(decoder)?))
  }
}

impl Decode for bool {
  fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
    match decoder.u8()? {
      0 => Ok(false),
      1 => Ok(true),
      other => Err(Error::decode(format!("invalid bool byte {}", other))),
    }
  }
}

impl Codec for char {
  type Signature = char;

  #[inline]
  fn encoded_size(&self) -> usize {
    size_of::<u32>()
  }

  #[inline]
  fn encode(&self, encoder: &mut Encoder<'_>) {
    encoder.put_u32(*self as u32);
  }

  fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>> {
    Ok(Arg::Char(char::decode(decoder)?))
  }
}

impl Decode for char {
  fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
    let raw = decoder.u32()?;
    char::from_u32(raw).ok_or_else(|| Error::decode(format!("invalid char {:#x}", raw)))
  }
}

#[inline]
fn decode_str<'a>(decoder: &mut Decoder<'a>) -> Result<&'a str> {
  let len = decoder.u32()? as usize;
  let bytes = decoder.take(len)?;
  std::str::from_utf8(bytes).map_err(|e| Error::decode(format!("invalid utf-8 in string argument: {}", e)))
}

impl Codec for str {
  type Signature = str;

  #[inline]
  fn encoded_size(&self) -> usize {
    size_of::<u32>() + self.len()
  }

  #[inline]
  fn encode(&self, encoder: &mut Encoder<'_>) {
    encoder.put_u32(self.len() as u32);
    encoder.put(self.as_bytes());
  }

  #[inline]
  fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>> {
    Ok(Arg::Str(decode_str(decoder)?))
  }
}

impl Codec for String {
  type Signature = str;

  #[inline]
  fn encoded_size(&self) -> usize {
    self.as_str().encoded_size()
  }

  #[inline]
  fn encode(&self, encoder: &mut Encoder<'_>) {
    self.as_str().encode(encoder);
  }

  #[inline]
  fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>> {
    str::decode_arg(decoder)
  }
}

impl Decode for String {
  fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
    Ok(decode_str(decoder)?.to_owned())
  }
}

impl<T: Codec + ?Sized> Codec for &T {
  type Signature = T::Signature;

  #[inline]
  fn encoded_size(&self) -> usize {
    (**self).encoded_size()
  }

  #[inline]
  fn encode(&self, encoder: &mut Encoder<'_>) {
    (**self).encode(encoder);
  }

  #[inline]
  fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>> {
    T::decode_arg(decoder)
  }
}

impl<T: Codec + ?Sized> Codec for Box<T> {
  type Signature = T::Signature;

  #[inline]
  fn encoded_size(&self) -> usize {
    (**self).encoded_size()
  }

  #[inline]
  fn encode(&self, encoder: &mut Encoder<'_>) {
    (**self).encode(encoder);
  }

  #[inline]
  fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>> {
    T::decode_arg(decoder)
  }
}

impl<T: Codec> Codec for [T] {
  type Signature = SeqOf<T::Signature>;

  fn encoded_size(&self) -> usize {
    size_of::<u32>() + self.iter().map(Codec::encoded_size).sum::<usize>()
  }

  fn encode(&self, encoder: &mut Encoder<'_>) {
    encoder.put_u32(self.len() as u32);
    for item in self {
      item.encode(encoder);
    }
  }

  fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>> {
    let len = decoder.u32()? as usize;
    let mut items = Vec::with_capacity(len.min(decoder.remaining()));
    for _ in 0..len {
      items.push(T::decode_arg(decoder)?);
    }
    Ok(Arg::List(items))
  }
}

impl<T: Codec> Codec for Vec<T> {
  type Signature = SeqOf<T::Signature>;

  #[inline]
  fn encoded_size(&self) -> usize {
    self.as_slice().encoded_size()
  }

  #[inline]
  fn encode(&self, encoder: &mut Encoder<'_>) {
    self.as_slice().encode(encoder);
  }

  #[inline]
  fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>> {
    <[T]>::decode_arg(decoder)
  }
}

impl<T: Decode> Decode for Vec<T> {
  fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
    let len = decoder.u32()? as usize;
    let mut items = Vec::with_capacity(len.min(decoder.remaining()));
    for _ in 0..len {
      items.push(T::decode(decoder)?);
    }
    Ok(items)
  }
}

impl<T: Codec, const N: usize> Codec for [T; N] {
  type Signature = ArrayOf<T::Signature, N>;

  fn encoded_size(&self) -> usize {
    self.iter().map(Codec::encoded_size).sum()
  }

  fn encode(&self, encoder: &mut Encoder<'_>) {
    for item in self {
      item.encode(encoder);
    }
  }

  fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>> {
    let mut items = Vec::with_capacity(N);
    for _ in 0..N {
      items.push(T::decode_arg(decoder)?);
    }
    Ok(Arg::List(items))
  }
}

impl<T: Decode, const N: usize> Decode for [T; N] {
  fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
    let mut items = Vec::with_capacity(N);
    for _ in 0..N {
      items.push(T::decode(decoder)?);
    }
    items
      .try_into()
      .map_err(|_| Error::decode(format!("expected {} array elements", N)))
  }
}

impl<T: Codec> Codec for Option<T> {
  type Signature = OptionOf<T::Signature>;

  fn encoded_size(&self) -> usize {
    1 + self.as_ref().map_or(0, Codec::encoded_size)
  }

  fn encode(&self, encoder: &mut Encoder<'_>) {
    match self {
      Some(value) => {
        encoder.put_u8(1);
        value.encode(encoder);
      },
      None => encoder.put_u8(0),
    }
  }

  fn decode_arg<'a>(decoder: &mut Decoder<'a>) -> Result<Arg<'a>> {
    match decoder.u8()? {
      0 => Ok(Arg::Opt(None)),
      1 => Ok(Arg::Opt(Some(Box::new(T::decode_arg(decoder)?)))),
      other => Err(Error::decode(format!("invalid option tag {}", other))),
    }
  }
}

impl<T: Decode> Decode for Option<T> {
  fn decode(decoder: &mut Decoder<'_>) -> Result<Self> {
    match decoder.u8()? {
      0 => Ok(None),
      1 => Ok(Some(T::decode(decoder)?)),
      other => Err(Error::decode(format!("invalid option tag {}", other))),
    }
  }
}

/// Decoded arguments of one record. Eight inline slots cover most call sites.
pub type ArgList<'a> = SmallVec<[Arg<'a>; 8]>;

/// Decode routine of one argument-list signature, referenced from the record header.
pub type DecodeArgsFn = for<'a> fn(&mut Decoder<'a>, &mut ArgList<'a>) -> Result<()>;

/// A whole argument list, implemented for tuples of [`Codec`] types.
pub trait EncodeArgs {
  type Signature: 'static;

  fn encoded_size(&self) -> usize;

  fn encode(&self, encoder: &mut Encoder<'_>);

  fn decode_args<'a>(decoder: &mut Decoder<'a>, out: &mut ArgList<'a>) -> Result<()>;
}

macro_rules! impl_encode_args {
  ($($name:ident),*) => {
    #[allow(non_snake_case, unused_variables)]
    impl<$($name: Codec),*> EncodeArgs for ($($name,)*) {
      type Signature = ($(PhantomData<<$name as Codec>::Signature>,)*);

      #[inline]
      fn encoded_size(&self) -> usize {
        let ($($name,)*) = self;
        0 $(+ $name.encoded_size())*
      }

      #[inline]
      fn encode(&self, encoder: &mut Encoder<'_>) {
        let ($($name,)*) = self;
        $($name.encode(encoder);)*
      }

      fn decode_args<'a>(decoder: &mut Decoder<'a>, out: &mut ArgList<'a>) -> Result<()> {
        $(out.push(<$name as Codec>::decode_arg(decoder)?);)*
        Ok(())
      }
    }
  };
}

impl_encode_args!();
impl_encode_args!(A);
impl_encode_args!(A, B);
impl_encode_args!(A, B, C);
impl_encode_args!(A, B, C, D);
impl_encode_args!(A, B, C, D, E);
impl_encode_args!(A, B, C, D, E, F);
impl_encode_args!(A, B, C, D, E, F, G);
impl_encode_args!(A, B, C, D, E, F, G, H);
impl_encode_args!(A, B, C, D, E, F, G, H, I);
impl_encode_args!(A, B, C, D, E, F, G, H, I, J);
impl_encode_args!(A, B, C, D, E, F, G, H, I, J, K);
impl_encode_args!(A, B, C, D, E, F, G, H, I, J, K, L);
