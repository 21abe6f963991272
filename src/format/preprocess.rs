//! Preprocessors (§4.3): optional per-format rewrite of oversized inputs
//! into a trimmed temp file before parsing.

use crate::error::Result;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub trait Preprocessor: Send + Sync {
    /// Whether this input is large enough to be worth trimming.
    fn needs_preprocess(&self, path: &Path, size: u64) -> bool;

    /// Rewrites `path` into a new temp file, returning its path. The
    /// caller deletes the temp file after import regardless of outcome
    /// (§4.3).
    fn preprocess(
        &self,
        path: &Path,
        temp_dir: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<PathBuf>;
}

/// Some QQ exporter versions embed a `"raw_source"` field per message,
/// carrying the entire unparsed source line as a duplicate string.
/// [`super::qq::QqParser`] never reads it, and it roughly doubles file
/// size on exports that include it.
const TRIM_THRESHOLD_BYTES: u64 = 64 * 1024 * 1024;
const STRIP_KEY: &[u8] = b"raw_source";

pub struct QqPreprocessor;

impl Preprocessor for QqPreprocessor {
    fn needs_preprocess(&self, _path: &Path, size: u64) -> bool {
        size >= TRIM_THRESHOLD_BYTES
    }

    fn preprocess(
        &self,
        path: &Path,
        temp_dir: &Path,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<PathBuf> {
        let total_bytes = std::fs::metadata(path)?.len();
        std::fs::create_dir_all(temp_dir)?;
        let out_path = temp_dir.join(format!("preprocess_{}.json", uuid::Uuid::new_v4().simple()));

        let mut reader = BufReader::new(File::open(path)?);
        let mut writer = BufWriter::new(File::create(&out_path)?);
        strip_raw_source_fields(&mut reader, &mut writer, total_bytes, on_progress)?;
        writer.flush()?;
        on_progress(total_bytes, total_bytes);
        Ok(out_path)
    }
}

/// A byte reader with one-byte pushback, so a key can be read in full
/// before deciding (by peeking past it) whether it's followed by a `:`.
struct PushbackReader<'a> {
    inner: &'a mut dyn Read,
    pending: Option<u8>,
    bytes_read: u64,
}

impl<'a> PushbackReader<'a> {
    fn new(inner: &'a mut dyn Read) -> Self {
        Self {
            inner,
            pending: None,
            bytes_read: 0,
        }
    }

    fn next(&mut self) -> Result<Option<u8>> {
        if let Some(b) = self.pending.take() {
            return Ok(Some(b));
        }
        let mut buf = [0u8; 1];
        if self.inner.read(&mut buf)? == 0 {
            return Ok(None);
        }
        self.bytes_read += 1;
        Ok(Some(buf[0]))
    }

    fn push_back(&mut self, b: u8) {
        self.pending = Some(b);
    }
}

/// Copies `reader` to `writer`, dropping any object key named
/// `"raw_source"` and its string value along with the comma that
/// separated it from a neighboring field, so the result stays valid
/// JSON whether the stripped field was first, last, or the only one in
/// its object.
///
/// Strings are read in full (content plus the exact raw bytes, escapes
/// included) before a key/value decision is made, since a `"` merely
/// *opens* a string — whether its content is `raw_source` can only be
/// known once the matching closing quote is found, and whether it's a
/// key rather than a value can only be known by looking past that quote
/// for a `:`.
///
/// Commas are never copied from the input; they're regenerated from
/// `stack`, which tracks, per open `{`/`[`, whether that scope has
/// already emitted a field or element. A comma read from the input is
/// held as `pending_comma` and only written before the next token that
/// is *not* the first one in its scope — so a dropped field never
/// leaves behind a leading, trailing, or doubled comma, regardless of
/// its position.
fn strip_raw_source_fields(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    total_bytes: u64,
    on_progress: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    let mut r = PushbackReader::new(reader);
    let mut last_report: u64 = 0;
    let mut pending_comma = false;
    let mut scopes: Vec<bool> = Vec::new();

    while let Some(b) = r.next()? {
        match b {
            b',' => pending_comma = true,
            b'{' | b'[' => {
                begin_token(writer, &mut pending_comma, &mut scopes)?;
                writer.write_all(&[b])?;
                scopes.push(true);
            }
            b'}' | b']' => {
                pending_comma = false;
                writer.write_all(&[b])?;
                scopes.pop();
            }
            b'"' => {
                let (raw, content) = read_string(&mut r)?;
                let is_key = peek_colon(&mut r)?;
                if is_key && content == STRIP_KEY {
                    skip_value(&mut r)?;
                } else {
                    begin_token(writer, &mut pending_comma, &mut scopes)?;
                    writer.write_all(&raw)?;
                    if is_key {
                        writer.write_all(b":")?;
                    }
                }
            }
            _ => {
                begin_token(writer, &mut pending_comma, &mut scopes)?;
                writer.write_all(&[b])?;
            }
        }

        if r.bytes_read - last_report >= 1 << 16 {
            on_progress(r.bytes_read.min(total_bytes), total_bytes);
            last_report = r.bytes_read;
        }
    }
    Ok(())
}

/// Call before writing any token that opens a new value in the current
/// scope (a structural bracket, a kept string, or the first byte of a
/// bare scalar like a number). The first token written in a freshly
/// opened scope never gets a leading comma, however many commas or
/// dropped fields preceded it in the input; every later token gets one
/// if `pending_comma` is set.
fn begin_token(writer: &mut dyn Write, pending_comma: &mut bool, scopes: &mut [bool]) -> Result<()> {
    if let Some(is_first) = scopes.last_mut() {
        if *is_first {
            *is_first = false;
            *pending_comma = false;
            return Ok(());
        }
    }
    if *pending_comma {
        writer.write_all(b",")?;
        *pending_comma = false;
    }
    Ok(())
}

/// Reads a JSON string whose opening quote was already consumed,
/// returning its raw bytes (quotes included, escapes untouched) and its
/// unescaped content.
fn read_string(r: &mut PushbackReader) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut raw = vec![b'"'];
    let mut content = Vec::new();
    let mut escape = false;
    while let Some(b) = r.next()? {
        raw.push(b);
        if escape {
            escape = false;
            content.push(b);
            continue;
        }
        if b == b'\\' {
            escape = true;
            continue;
        }
        if b == b'"' {
            return Ok((raw, content));
        }
        content.push(b);
    }
    Ok((raw, content))
}

/// True if the next non-pushed-back byte is `:`; otherwise pushes it
/// back so the caller's main loop processes it normally.
fn peek_colon(r: &mut PushbackReader) -> Result<bool> {
    match r.next()? {
        Some(b':') => Ok(true),
        Some(b) => {
            r.push_back(b);
            Ok(false)
        }
        None => Ok(false),
    }
}

/// Having just consumed a matched key's `:`, discards its value. Its own
/// trailing comma (if any) is left for the main loop's pending-comma
/// handling to sort out.
fn skip_value(r: &mut PushbackReader) -> Result<()> {
    loop {
        match r.next()? {
            Some(b) if b.is_ascii_whitespace() => continue,
            Some(b'"') => return skip_string_value(r),
            _ => return Ok(()),
        }
    }
}

fn skip_string_value(r: &mut PushbackReader) -> Result<()> {
    let mut escape = false;
    while let Some(b) = r.next()? {
        if escape {
            escape = false;
        } else if b == b'\\' {
            escape = true;
        } else if b == b'"' {
            return Ok(());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn strip(input: &str) -> String {
        let mut reader = Cursor::new(input.as_bytes());
        let mut out = Vec::new();
        strip_raw_source_fields(&mut reader, &mut out, input.len() as u64, &mut |_, _| {})
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn strips_raw_source_field() {
        let input = r#"{"uin":"10","raw_source":"blob with \"quotes\"","other":1}"#;
        let out = strip(input);
        assert!(!out.contains("raw_source"));
        assert!(out.contains("\"uin\":\"10\""));
        assert!(out.contains("\"other\":1"));
        assert!(serde_json::from_str::<serde_json::Value>(&out).is_ok());
    }

    #[test]
    fn leaves_input_without_field_untouched() {
        let input = r#"{"uin":"10","nickname":"A"}"#;
        assert_eq!(strip(input), input);
    }

    #[test]
    fn does_not_touch_raw_source_text_inside_other_strings() {
        let input = r#"{"content":"mentions raw_source in text"}"#;
        assert_eq!(strip(input), input);
    }

    #[test]
    fn strips_raw_source_field_when_it_is_last() {
        let input = r#"{"uin":"10","raw_source":"blob"}"#;
        let out = strip(input);
        assert_eq!(out, r#"{"uin":"10"}"#);
        assert!(serde_json::from_str::<serde_json::Value>(&out).is_ok());
    }

    #[test]
    fn strips_raw_source_field_when_it_is_first() {
        let input = r#"{"raw_source":"blob","uin":"10"}"#;
        let out = strip(input);
        assert_eq!(out, r#"{"uin":"10"}"#);
        assert!(serde_json::from_str::<serde_json::Value>(&out).is_ok());
    }

    #[test]
    fn needs_preprocess_respects_threshold() {
        let pre = QqPreprocessor;
        assert!(!pre.needs_preprocess(Path::new("x.json"), 1024));
        assert!(pre.needs_preprocess(Path::new("x.json"), TRIM_THRESHOLD_BYTES));
    }
}
