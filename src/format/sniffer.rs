//! Format sniffer (§4.1): pure, bounded, side-effect free format
//! detection over a bounded prefix of a file.

use super::DEFAULT_SNIFF_PREFIX;
use super::registry::{FormatDescriptor, Registry};
use crate::error::{Diagnosis, Error, PartialMatch, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Reads up to `len` bytes from the start of `path`.
pub fn read_prefix(path: &Path, len: usize) -> Result<Vec<u8>> {
    let mut f = File::open(path)?;
    let mut buf = vec![0u8; len];
    let mut total = 0usize;
    loop {
        let n = f.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
        if total == buf.len() {
            break;
        }
    }
    buf.truncate(total);
    Ok(buf)
}

fn extension_matches(path: &Path, descriptor: &FormatDescriptor) -> bool {
    if descriptor.extensions.is_empty() {
        return true;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => descriptor
            .extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(ext)),
        None => false,
    }
}

fn missing_signatures(prefix: &[u8], descriptor: &FormatDescriptor) -> Vec<String> {
    let mut missing = Vec::new();
    for pat in &descriptor.signature.patterns {
        if !pat.is_match(prefix) {
            missing.push(format!("pattern:{}", pat.as_str()));
        }
    }
    for field in &descriptor.signature.required_fields {
        let needle = format!("\"{field}\"");
        if !contains_bytes(prefix, needle.as_bytes()) {
            missing.push(field.to_string());
        }
    }
    missing
}

fn satisfied_signature_count(prefix: &[u8], descriptor: &FormatDescriptor) -> usize {
    let total = descriptor.signature.patterns.len() + descriptor.signature.required_fields.len();
    total - missing_signatures(prefix, descriptor).len()
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Detection result: a matched format id or a diagnosis (§4.1).
pub enum Detection {
    Matched(&'static str),
    Unmatched(Diagnosis),
}

/// Evaluate formats in priority order, returning the first whose
/// extension matches (if constrained), all regex patterns match at
/// least once, and all required field names appear in the prefix.
pub fn sniff(path: &Path, registry: &Registry) -> Result<Detection> {
    sniff_with_prefix_len(path, registry, DEFAULT_SNIFF_PREFIX)
}

pub fn sniff_with_prefix_len(
    path: &Path,
    registry: &Registry,
    prefix_len: usize,
) -> Result<Detection> {
    let prefix = read_prefix(path, prefix_len)?;
    sniff_bytes(&prefix, path, registry)
}

/// Pure variant operating directly on an in-memory prefix — this is the
/// unit-testable core of detection (§4.1: "pure, bounded, side-effect
/// free").
pub fn sniff_bytes(prefix: &[u8], path: &Path, registry: &Registry) -> Result<Detection> {
    let mut partials: Vec<PartialMatch> = Vec::new();

    for descriptor in registry.ordered_by_priority() {
        if !extension_matches(path, descriptor) {
            continue;
        }
        let missing = missing_signatures(prefix, descriptor);
        if missing.is_empty() {
            return Ok(Detection::Matched(descriptor.id));
        }
        if satisfied_signature_count(prefix, descriptor) >= 1 {
            partials.push(PartialMatch {
                format_name: descriptor.display_name.to_string(),
                missing_fields: missing,
            });
        }
    }

    Ok(Detection::Unmatched(Diagnosis {
        suggestion: "unrecognized_format".to_string(),
        partial_matches: partials,
    }))
}

pub fn sniff_or_error(path: &Path, registry: &Registry) -> Result<&'static str> {
    match sniff(path, registry)? {
        Detection::Matched(id) => Ok(id),
        Detection::Unmatched(diagnosis) => Err(Error::UnrecognizedFormat {
            path: path.to_path_buf(),
            diagnosis,
        }),
    }
}
