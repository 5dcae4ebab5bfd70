use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt};

use crate::errors::{new_io_error, Result};
use crate::CR_LF;

/// Bodies larger than this are refused instead of buffered.
pub(crate) const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

/// A body.
#[derive(Clone, PartialEq, Eq)]
pub struct Body {
  inner: Bytes,
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Body {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}

impl Default for Body {
  fn default() -> Self {
    Self {
      inner: Bytes::new(),
    }
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    Body {
      inner: Bytes::from_static(s.as_bytes()),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl Body {
  /// Body as text, invalid UTF-8 replaced.
  pub fn to_text(&self) -> String {
    String::from_utf8_lossy(&self.inner).to_string()
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Debug::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

impl fmt::Display for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str(&String::from_utf8_lossy(&self.inner))
  }
}

/// Read a `Content-Length` framed body.
pub(crate) async fn read_sized<R>(reader: &mut R, length: u64) -> Result<Vec<u8>>
where
  R: AsyncRead + Unpin,
{
  if length > MAX_BODY_SIZE {
    return Err(new_io_error(
      std::io::ErrorKind::InvalidData,
      "body exceeds maximum allowed size",
    ));
  }
  let mut body = vec![0; length as usize];
  reader.read_exact(&mut body).await?;
  Ok(body)
}

/// Read a body delimited by the peer closing the connection.
pub(crate) async fn read_to_close<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncRead + Unpin,
{
  let mut body = Vec::new();
  reader.take(MAX_BODY_SIZE + 1).read_to_end(&mut body).await?;
  if body.len() as u64 > MAX_BODY_SIZE {
    return Err(new_io_error(
      std::io::ErrorKind::InvalidData,
      "body exceeds maximum allowed size",
    ));
  }
  Ok(body)
}

/// Read and decode a `Transfer-Encoding: chunked` body, trailers are dropped.
pub(crate) async fn read_chunked<R>(reader: &mut R) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if reader.read_until(b'\n', &mut line).await? == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "chunked body ended before the last chunk",
      ));
    }
    let size_line = trim_line(&line);
    // chunk extensions are ignored
    let size_hex = size_line.split(|b| b == &b';').next().unwrap_or_default();
    let size_hex = std::str::from_utf8(size_hex)
      .map_err(|_| new_io_error(std::io::ErrorKind::InvalidData, "invalid chunk size"))?;
    let size = u64::from_str_radix(size_hex.trim(), 16)?;
    if size == 0 {
      // trailer section ends with an empty line
      loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 || trim_line(&line).is_empty() {
          break;
        }
      }
      break;
    }
    if body.len() as u64 + size > MAX_BODY_SIZE {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "body exceeds maximum allowed size",
      ));
    }
    let mut chunk = vec![0; size as usize];
    reader.read_exact(&mut chunk).await?;
    body.append(&mut chunk);
    line.clear();
    reader.read_until(b'\n', &mut line).await?;
  }
  Ok(body)
}

pub(crate) fn trim_line(line: &[u8]) -> &[u8] {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  line.strip_suffix(&CR_LF[..1]).unwrap_or(line)
}
