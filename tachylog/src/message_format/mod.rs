//! # Message Format
//!
//! Renders a call site's format string with its decoded arguments on the backend.
//! Format strings are parsed once into a [`FormatTemplate`] and cached per call
//! site.
//!
//! ## Placeholders
//!
//! `{}` takes the next argument, `{0}` an explicit one and `{name}` the next
//! argument while also recording it as a structured key/value pair. After a `:`
//! the usual spec is accepted: `[[fill]align][#][0][width][.precision][?|x|X|b]`.
//! `{{` and `}}` are literal braces.


use std::fmt::Write;

use crate::codec::Arg;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Align {
  Left,
  Right,
  Center,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
  Display,
  Debug,
  LowerHex,
  UpperHex,
  Binary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatSpec {
  pub fill: char,
  pub align: Option<Align>,
  pub alternate: bool,
  pub zero_pad: bool,
  pub width: Option<usize>,
  pub precision: Option<usize>,
  pub kind: Kind,
}

impl Default for FormatSpec {
  fn default() -> Self {
    Self {
      fill: ' ',
      align: None,
      alternate: false,
      zero_pad: false,
      width: None,
      precision: None,
      kind: Kind::Display,
    }
  }
}

fn align_of(c: char) -> Option<Align> {
  match c {
    '<' => Some(Align::Left),
    '>' => Some(Align::Right),
    '^' => Some(Align::Center),
    _ => None,
  }
}

impl FormatSpec {
  pub fn parse(spec: &str) -> Result<Self> {
    let mut out = FormatSpec::default();
    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;

    if chars.len() >= 2 && align_of(chars[1]).is_some() {
      out.fill = chars[0];
      out.align = align_of(chars[1]);
      i = 2;
    } else if let Some(align) = chars.first().and_then(|c| align_of(*c)) {
      out.align = Some(align);
      i = 1;
    }

    if chars.get(i) == Some(&'#') {
      out.alternate = true;
      i += 1;
    }
    if chars.get(i) == Some(&'0') {
      out.zero_pad = true;
      i += 1;
    }

    let start = i;
    while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
      i += 1;
    }
    if i > start {
      out.width = Some(parse_number(&chars[start..i], spec)?);
    }

    if chars.get(i) == Some(&'.') {
      i += 1;
      let start = i;
      while chars.get(i).is_some_and(|c| c.is_ascii_digit()) {
        i += 1;
      }
      if i == start {
        return Err(Error::decode(format!("missing precision in format spec '{}'", spec)));
      }
      out.precision = Some(parse_number(&chars[start..i], spec)?);
    }

    out.kind = match &chars[i..] {
      [] => Kind::Display,
      ['?'] => Kind::Debug,
      ['x'] => Kind::LowerHex,
      ['X'] => Kind::UpperHex,
      ['b'] => Kind::Binary,
      _ => return Err(Error::decode(format!("unsupported format spec '{}'", spec))),
    };

    Ok(out)
  }
}

fn parse_number(digits: &[char], spec: &str) -> Result<usize> {
  digits
    .iter()
    .collect::<String>()
    .parse()
    .map_err(|_| Error::decode(format!("invalid number in format spec '{}'", spec)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Arg {
    index: usize,
    name: Option<String>,
    spec: FormatSpec,
  },
}

/// A parsed format string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatTemplate {
  segments: Vec<Segment>,
  has_named_args: bool,
}

impl FormatTemplate {
  pub fn parse(format: &str) -> Result<Self> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut next_index = 0usize;
    let mut has_named_args = false;
    let mut chars = format.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
      match c {
        '{' if chars.peek().map(|(_, c)| *c) == Some('{') => {
          chars.next();
          literal.push('{');
        },
        '{' => {
          let mut body = String::new();
          let mut closed = false;
          for (_, c) in chars.by_ref() {
            if c == '}' {
              closed = true;
              break;
            }
            body.push(c);
          }
          if !closed {
            return Err(Error::decode(format!("unterminated placeholder at byte {}", pos)));
          }

          if !literal.is_empty() {
            segments.push(Segment::Literal(std::mem::take(&mut literal)));
          }

          let (name, spec) = match body.split_once(':') {
            Some((name, spec)) => (name.trim(), FormatSpec::parse(spec)?),
            None => (body.trim(), FormatSpec::default()),
          };

          let (index, name) = if name.is_empty() {
            next_index += 1;
            (next_index - 1, None)
          } else if name.chars().all(|c| c.is_ascii_digit()) {
            let index = name
              .parse()
              .map_err(|_| Error::decode(format!("invalid argument index '{}'", name)))?;
            (index, None)
          } else if name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            has_named_args = true;
            next_index += 1;
            (next_index - 1, Some(name.to_string()))
          } else {
            return Err(Error::decode(format!("invalid argument name '{}'", name)));
          };

          segments.push(Segment::Arg { index, name, spec });
        },
        '}' if chars.peek().map(|(_, c)| *c) == Some('}') => {
          chars.next();
          literal.push('}');
        },
        '}' => {
          return Err(Error::decode(format!("unmatched '}}' at byte {}", pos)));
        },
        c => literal.push(c),
      }
    }

    if !literal.is_empty() {
      segments.push(Segment::Literal(literal));
    }

    Ok(Self {
      segments,
      has_named_args,
    })
  }

  #[inline]
  pub fn has_named_args(&self) -> bool {
    self.has_named_args
  }

  pub fn segments(&self) -> &[Segment] {
    &self.segments
  }

  /// Appends the rendered message to `out`.
  pub fn render(&self, args: &[Arg<'_>], out: &mut String, printable: Option<fn(char) -> bool>) -> Result<()> {
    for segment in &self.segments {
      match segment {
        Segment::Literal(text) => out.push_str(text),
        Segment::Arg { index, spec, .. } => {
          let arg = lookup(args, *index)?;
          render_arg(arg, spec, out, printable)?;
        },
      }
    }
    Ok(())
  }

  /// Pushes a `(name, rendered value)` pair for every named placeholder.
  pub fn named_args(
    &self,
    args: &[Arg<'_>],
    out: &mut Vec<(String, String)>,
    printable: Option<fn(char) -> bool>,
  ) -> Result<()> {
    for segment in &self.segments {
      if let Segment::Arg {
        index,
        name: Some(name),
        spec,
      } = segment
      {
        let mut value = String::new();
        render_arg(lookup(args, *index)?, spec, &mut value, printable)?;
        out.push((name.clone(), value));
      }
    }
    Ok(())
  }
}

fn lookup<'b, 'a>(args: &'b [Arg<'a>], index: usize) -> Result<&'b Arg<'a>> {
  args.get(index).ok_or_else(|| {
    Error::decode(format!(
      "argument {} requested but only {} provided",
      index,
      args.len()
    ))
  })
}

/// One-shot helper: parse `format` and render it with `args`.
pub fn format_message(format: &str, args: &[Arg<'_>]) -> Result<String> {
  let mut out = String::new();
  FormatTemplate::parse(format)?.render(args, &mut out, None)?;
  Ok(out)
}

/// Default printable check: visible ASCII and newline.
pub fn is_printable_ascii(c: char) -> bool {
  (' '..='~').contains(&c) || c == '\n'
}

fn is_numeric(arg: &Arg<'_>) -> bool {
  matches!(
    arg,
    Arg::I64(_) | Arg::U64(_) | Arg::I128(_) | Arg::U128(_) | Arg::F32(_) | Arg::F64(_)
  )
}

pub fn render_arg(arg: &Arg<'_>, spec: &FormatSpec, out: &mut String, printable: Option<fn(char) -> bool>) -> Result<()> {
  let Some(width) = spec.width else {
    return write_arg(arg, spec, out, printable);
  };

  let mut body = String::new();
  write_arg(arg, spec, &mut body, printable)?;

  let len = body.chars().count();
  if len >= width {
    out.push_str(&body);
    return Ok(());
  }
  let pad = width - len;

  if spec.zero_pad && is_numeric(arg) {
    let prefix_len = numeric_prefix_len(&body);
    out.push_str(&body[..prefix_len]);
    out.extend(std::iter::repeat_n('0', pad));
    out.push_str(&body[prefix_len..]);
    return Ok(());
  }

  let default_align = if is_numeric(arg) { Align::Right } else { Align::Left };
  let (before, after) = match spec.align.unwrap_or(default_align) {
    Align::Left => (0, pad),
    Align::Right => (pad, 0),
    Align::Center => (pad / 2, pad - pad / 2),
  };
  out.extend(std::iter::repeat_n(spec.fill, before));
  out.push_str(&body);
  out.extend(std::iter::repeat_n(spec.fill, after));
  Ok(())
}

fn numeric_prefix_len(body: &str) -> usize {
  let sign = usize::from(body.starts_with('-') || body.starts_with('+'));
  let rest = &body[sign..];
  if rest.starts_with("0x") || rest.starts_with("0X") || rest.starts_with("0b") {
    sign + 2
  } else {
    sign
  }
}

fn write_str(s: &str, spec: &FormatSpec, out: &mut String, printable: Option<fn(char) -> bool>) -> Result<()> {
  let s = match spec.precision {
    Some(p) => match s.char_indices().nth(p) {
      Some((end, _)) => &s[..end],
      None => s,
    },
    None => s,
  };

  match printable {
    Some(check) if !s.chars().all(check) => {
      let mut sanitized = String::with_capacity(s.len() + 8);
      for c in s.chars() {
        if check(c) {
          sanitized.push(c);
        } else {
          let mut buf = [0u8; 4];
          for byte in c.encode_utf8(&mut buf).bytes() {
            write!(sanitized, "\\x{:02X}", byte)?;
          }
        }
      }
      if spec.kind == Kind::Debug {
        write!(out, "\"{}\"", sanitized)?;
      } else {
        out.push_str(&sanitized);
      }
    },
    _ => {
      if spec.kind == Kind::Debug {
        write!(out, "{:?}", s)?;
      } else {
        out.push_str(s);
      }
    },
  }
  Ok(())
}

macro_rules! write_int {
  ($out:expr, $spec:expr, $v:expr, $arg:expr) => {
    match ($spec.kind, $spec.alternate) {
      (Kind::Display, _) | (Kind::Debug, _) => write!($out, "{}", $v)?,
      (Kind::LowerHex, false) => write!($out, "{:x}", $v)?,
      (Kind::LowerHex, true) => write!($out, "{:#x}", $v)?,
      (Kind::UpperHex, false) => write!($out, "{:X}", $v)?,
      (Kind::UpperHex, true) => write!($out, "{:#X}", $v)?,
      (Kind::Binary, false) => write!($out, "{:b}", $v)?,
      (Kind::Binary, true) => write!($out, "{:#b}", $v)?,
    }
  };
}

fn write_arg(arg: &Arg<'_>, spec: &FormatSpec, out: &mut String, printable: Option<fn(char) -> bool>) -> Result<()> {
  let textual = matches!(spec.kind, Kind::Display | Kind::Debug);
  match arg {
    Arg::I64(v) => write_int!(out, spec, v, arg),
    Arg::U64(v) => write_int!(out, spec, v, arg),
    Arg::I128(v) => write_int!(out, spec, v, arg),
    Arg::U128(v) => write_int!(out, spec, v, arg),
    _ if !textual && !matches!(arg, Arg::List(_) | Arg::Opt(_)) => {
      return Err(Error::decode(format!(
        "format spec {:?} only applies to integer arguments",
        spec.kind
      )));
    },
    Arg::F32(v) => match spec.precision {
      Some(p) => write!(out, "{:.*}", p, v)?,
      None if spec.kind == Kind::Debug => write!(out, "{:?}", v)?,
      None => write!(out, "{}", v)?,
    },
    Arg::F64(v) => match spec.precision {
      Some(p) => write!(out, "{:.*}", p, v)?,
      None if spec.kind == Kind::Debug => write!(out, "{:?}", v)?,
      None => write!(out, "{}", v)?,
    },
    Arg::Bool(v) => write!(out, "{}", v)?,
    Arg::Char(v) if spec.kind == Kind::Debug => write!(out, "{:?}", v)?,
    Arg::Char(v) => out.push(*v),
    Arg::Str(s) => write_str(s, spec, out, printable)?,
    Arg::List(items) => {
      let inner = FormatSpec {
        width: None,
        ..spec.clone()
      };
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push_str(", ");
        }
        write_arg(item, &inner, out, printable)?;
      }
      out.push(']');
    },
    Arg::Opt(None) => out.push_str("None"),
    Arg::Opt(Some(inner)) => {
      out.push_str("Some(");
      write_arg(inner, spec, out, printable)?;
      out.push(')');
    },
    Arg::Display(v) => match spec.precision {
      Some(p) => write!(out, "{:.*}", p, v)?,
      None => write!(out, "{}", v)?,
    },
    Arg::Debug(v) if spec.alternate => write!(out, "{:#?}", v)?,
    Arg::Debug(v) => write!(out, "{:?}", v)?,
  }
  Ok(())
}
