//! Streaming JSON array scanner.
//!
//! Parsers never deserialize the whole file (§4.2 "never load the full
//! input into memory"). Instead this module locates a top-level
//! `"key": [ ... ]` array within a byte stream and yields the raw bytes
//! of each element one at a time, using a brace/bracket-depth state
//! machine that respects string escapes — the same technique §4.2
//! prescribes for extracting an avatar section from a second bounded
//! scan.

use crate::error::{Error, Result};
use std::io::Read;

/// Wraps any `Read`, counting bytes as they are consumed, for the
/// monotonic `bytesRead` progress reporting required by §4.2/§5.
pub struct CountingReader<R> {
    inner: R,
    pub bytes_read: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
        }
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read += n as u64;
        Ok(n)
    }
}

/// Scans a prefix buffer for `"key"` followed by `:` and `[`, returning
/// the byte offset immediately after the `[`. Not nesting-aware (a
/// best-effort bounded-prefix search, matching §4.1's bounded-prefix
/// sniffing contract); formats are expected to place their arrays at
/// the top level so this is sufficient in practice.
pub fn find_array_start(haystack: &[u8], key: &str) -> Option<usize> {
    let needle = format!("\"{key}\"");
    let mut search_from = 0usize;
    while let Some(rel) = find_subslice(&haystack[search_from..], needle.as_bytes()) {
        let key_pos = search_from + rel;
        let mut i = key_pos + needle.len();
        while i < haystack.len() && haystack[i].is_ascii_whitespace() {
            i += 1;
        }
        if i < haystack.len() && haystack[i] == b':' {
            i += 1;
            while i < haystack.len() && haystack[i].is_ascii_whitespace() {
                i += 1;
            }
            if i < haystack.len() && haystack[i] == b'[' {
                return Some(i + 1);
            }
        }
        search_from = key_pos + needle.len();
    }
    None
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads forward from `reader` until it has consumed `"key": [` (modulo
/// whitespace), leaving the stream positioned right after the `[`.
/// Returns `false` if the key is never found before EOF. Bounded memory:
/// only a small rolling window the size of the needle is retained.
pub fn skip_to_array_start(reader: &mut dyn Read, key: &str) -> Result<bool> {
    let needle = format!("\"{key}\"");
    let needle = needle.as_bytes();
    let mut window: Vec<u8> = Vec::with_capacity(needle.len());
    let mut buf = [0u8; 1];

    loop {
        let n = reader.read(&mut buf).map_err(Error::from)?;
        if n == 0 {
            return Ok(false);
        }
        window.push(buf[0]);
        if window.len() > needle.len() {
            window.remove(0);
        }
        if window == needle {
            break;
        }
    }

    // Consume whitespace, ':', whitespace, then '['.
    let mut saw_colon = false;
    loop {
        let n = reader.read(&mut buf).map_err(Error::from)?;
        if n == 0 {
            return Ok(false);
        }
        let b = buf[0];
        if b.is_ascii_whitespace() {
            continue;
        }
        if !saw_colon && b == b':' {
            saw_colon = true;
            continue;
        }
        if saw_colon && b == b'[' {
            return Ok(true);
        }
        if !saw_colon {
            // Matched substring wasn't actually the key (e.g. occurred
            // inside another string) — keep scanning for the real key.
            continue;
        }
        return Ok(false);
    }
}

/// Extracts a single named JSON object field from a head buffer by
/// locating `"key": {` and brace-matching its contents, then parsing
/// that slice independently. Used for small, fixed-shape meta objects
/// that precede the large message/member arrays (§4.2).
pub fn extract_object_field<T: for<'de> serde::Deserialize<'de>>(
    head: &[u8],
    key: &str,
) -> Option<T> {
    let needle = format!("\"{key}\"");
    let key_pos = head
        .windows(needle.len())
        .position(|w| w == needle.as_bytes())?;
    let mut i = key_pos + needle.len();
    while i < head.len() && head[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= head.len() || head[i] != b':' {
        return None;
    }
    i += 1;
    while i < head.len() && head[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= head.len() || head[i] != b'{' {
        return None;
    }
    let start = i;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    while i < head.len() {
        let b = head[i];
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return serde_json::from_slice(&head[start..=i]).ok();
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Pulls successive top-level elements out of a JSON array whose
/// contents are being streamed byte-by-byte from `reader`. The caller
/// must have already consumed everything up to (and including) the
/// array's opening `[`.
pub struct ArrayItemScanner<'a> {
    reader: &'a mut dyn Read,
    done: bool,
    bytes_read: u64,
}

impl<'a> ArrayItemScanner<'a> {
    pub fn new(reader: &'a mut dyn Read) -> Self {
        Self {
            reader,
            done: false,
            bytes_read: 0,
        }
    }

    /// Bytes consumed from `reader` since this scanner was created.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Returns the raw bytes of the next array element, or `None` once
    /// the closing `]` of the array has been consumed.
    pub fn next_item(&mut self) -> Result<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }
        let mut buf = [0u8; 1];
        let mut item: Vec<u8> = Vec::new();
        let mut depth: i32 = 0;
        let mut in_string = false;
        let mut escape = false;
        let mut started = false;

        loop {
            let n = self
                .reader
                .read(&mut buf)
                .map_err(Error::from)?;
            self.bytes_read += n as u64;
            if n == 0 {
                self.done = true;
                return if started {
                    Err(Error::Parse("truncated JSON array element".into()))
                } else {
                    Ok(None)
                };
            }
            let b = buf[0];

            if !started {
                if b.is_ascii_whitespace() || b == b',' {
                    continue;
                }
                if b == b']' {
                    self.done = true;
                    return Ok(None);
                }
                started = true;
            }

            item.push(b);

            if in_string {
                if escape {
                    escape = false;
                } else if b == b'\\' {
                    escape = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }

            match b {
                b'"' => in_string = true,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(Some(item));
                    }
                }
                _ => {}
            }
        }
    }
}
