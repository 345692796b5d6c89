//! Record stream codec.
//!
//! A record is one newline-terminated line whose first whitespace-delimited
//! field is a canonical 36-character hyphenated UUID. Everything after the
//! identifier is opaque payload. Segments and replicate bodies are plain
//! concatenations of records.

use std::collections::HashSet;
use std::io::{Read, Write};

use uuid::Uuid;

use crate::error::{Error, Result};

/// Counts reported by [`copy_records`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub records: u64,
    pub bytes: u64,
}

/// Extract the leading record identifier.
///
/// The first non-empty ASCII-whitespace-delimited field must be a canonical
/// hyphenated UUID; anything else is fatal to the surrounding parse.
pub fn record_id(record: &[u8]) -> Result<Uuid> {
    let field = record
        .split(|b| b.is_ascii_whitespace())
        .find(|f| !f.is_empty())
        .ok_or_else(|| Error::InvalidUuid("record has no identifier field".to_string()))?;

    let text = std::str::from_utf8(field)
        .map_err(|_| Error::InvalidUuid("identifier is not valid UTF-8".to_string()))?;
    if text.len() != 36 {
        return Err(Error::InvalidUuid(format!(
            "identifier {:?} is not in canonical form",
            text
        )));
    }
    Uuid::parse_str(text)
        .map_err(|_| Error::InvalidUuid(format!("identifier {:?} is not a UUID", text)))
}

/// Merge record streams, dropping duplicate identifiers.
///
/// The readers are logically concatenated and scanned record by record.
/// The first occurrence of each identifier wins; later occurrences are
/// dropped. Surviving records are written to `out` in encounter order and
/// the total number of bytes written is returned. No readers means nothing
/// to do and returns 0.
pub fn merge_records<W: Write>(out: &mut W, readers: &mut [&mut dyn Read]) -> Result<u64> {
    if readers.is_empty() {
        return Ok(0);
    }

    let mut input = Vec::new();
    for reader in readers.iter_mut() {
        reader.read_to_end(&mut input)?;
    }

    let mut seen = HashSet::new();
    let mut kept: Vec<&[u8]> = Vec::new();
    for record in input.split_inclusive(|b| *b == b'\n') {
        if is_blank(record) {
            continue;
        }
        let id = record_id(record)?;
        if seen.insert(id) {
            kept.push(record);
        }
    }

    let mut written = 0u64;
    for record in kept {
        out.write_all(record)?;
        written += record.len() as u64;
    }
    Ok(written)
}

/// Copy a record stream through unchanged, validating every identifier.
///
/// Used where a body must be persisted verbatim but malformed records have
/// to be rejected before anything is acknowledged. Blank records are
/// skipped; the first invalid identifier aborts the copy.
pub fn copy_records<W: Write>(out: &mut W, src: &mut dyn Read) -> Result<CopyStats> {
    let mut input = Vec::new();
    src.read_to_end(&mut input)?;

    let mut stats = CopyStats::default();
    for record in input.split_inclusive(|b| *b == b'\n') {
        if is_blank(record) {
            continue;
        }
        record_id(record)?;
        out.write_all(record)?;
        stats.records += 1;
        stats.bytes += record.len() as u64;
    }
    Ok(stats)
}

fn is_blank(record: &[u8]) -> bool {
    record.strip_suffix(b"\n").unwrap_or(record).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID_A: &str = "9f2c7a4e-1b3d-4e5f-8a6b-0c1d2e3f4a5b";
    const ID_B: &str = "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9";
    const ID_C: &str = "deadbeef-dead-beef-dead-beefdeadbeef";

    fn merge_all(inputs: &[&str]) -> Result<(String, u64)> {
        let mut owned: Vec<&[u8]> = inputs.iter().map(|s| s.as_bytes()).collect();
        let mut readers: Vec<&mut dyn Read> =
            owned.iter_mut().map(|r| r as &mut dyn Read).collect();
        let mut out = Vec::new();
        let n = merge_records(&mut out, &mut readers)?;
        Ok((String::from_utf8(out).unwrap(), n))
    }

    #[test]
    fn merge_single_record_is_identity() {
        let input = format!("{ID_A} payload\n");
        let (out, n) = merge_all(&[&input]).unwrap();
        assert_eq!(out, input);
        assert_eq!(n, input.len() as u64);
    }

    #[test]
    fn merge_no_readers_writes_nothing() {
        let mut out = Vec::new();
        let n = merge_records(&mut out, &mut []).unwrap();
        assert_eq!(n, 0);
        assert!(out.is_empty());
    }

    #[test]
    fn merge_dedups_first_occurrence_wins() {
        let first = format!("{ID_A} one\n");
        let second = format!("{ID_A} two\n{ID_B} three\n");
        let (out, _) = merge_all(&[&first, &second]).unwrap();
        assert_eq!(out, format!("{ID_A} one\n{ID_B} three\n"));
    }

    #[test]
    fn merge_preserves_encounter_order_across_readers() {
        let first = format!("{ID_B} b\n");
        let second = format!("{ID_C} c\n{ID_A} a\n");
        let (out, _) = merge_all(&[&first, &second]).unwrap();
        assert_eq!(out, format!("{ID_B} b\n{ID_C} c\n{ID_A} a\n"));
    }

    #[test]
    fn merge_skips_blank_records() {
        let input = format!("\n{ID_A} one\n\n{ID_B} two\n");
        let (out, _) = merge_all(&[&input]).unwrap();
        assert_eq!(out, format!("{ID_A} one\n{ID_B} two\n"));
    }

    #[test]
    fn merge_keeps_unterminated_final_record() {
        let input = format!("{ID_A} one\n{ID_B} two");
        let (out, n) = merge_all(&[&input]).unwrap();
        assert_eq!(out, input);
        assert_eq!(n, input.len() as u64);
    }

    #[test]
    fn merge_rejects_missing_identifier() {
        let err = merge_all(&["   \n"]).unwrap_err();
        assert!(err.is_invalid_uuid());
    }

    #[test]
    fn merge_rejects_malformed_identifier() {
        let err = merge_all(&["not-a-uuid payload\n"]).unwrap_err();
        assert!(err.is_invalid_uuid());

        // Right shape, wrong alphabet.
        let err = merge_all(&["zzzzzzzz-zzzz-zzzz-zzzz-zzzzzzzzzzzz x\n"]).unwrap_err();
        assert!(err.is_invalid_uuid());
    }

    #[test]
    fn merge_rejects_non_canonical_identifier() {
        // Valid UUID in simple form, but not the 36-character wire form.
        let err = merge_all(&["9f2c7a4e1b3d4e5f8a6b0c1d2e3f4a5b x\n"]).unwrap_err();
        assert!(err.is_invalid_uuid());
    }

    #[test]
    fn copy_passes_records_through_with_counts() {
        let input = format!("{ID_A} one\n\n{ID_B} two\n");
        let mut out = Vec::new();
        let stats = copy_records(&mut out, &mut input.as_bytes()).unwrap();
        assert_eq!(out, format!("{ID_A} one\n{ID_B} two\n").into_bytes());
        assert_eq!(stats.records, 2);
        assert_eq!(stats.bytes, out.len() as u64);
    }

    #[test]
    fn copy_does_not_dedup() {
        let input = format!("{ID_A} one\n{ID_A} two\n");
        let mut out = Vec::new();
        let stats = copy_records(&mut out, &mut input.as_bytes()).unwrap();
        assert_eq!(stats.records, 2);
        assert_eq!(out, input.into_bytes());
    }

    #[test]
    fn copy_rejects_invalid_identifier() {
        let input = format!("{ID_A} one\nbogus two\n");
        let mut out = Vec::new();
        let err = copy_records(&mut out, &mut input.as_bytes()).unwrap_err();
        assert!(err.is_invalid_uuid());
    }

    #[test]
    fn copy_empty_stream_reports_zero() {
        let mut out = Vec::new();
        let stats = copy_records(&mut out, &mut "".as_bytes()).unwrap();
        assert_eq!(stats, CopyStats::default());
    }
}
