//! Symbol file codec
//!
//! Upstream symbol files are Breakpad text; the cache stores a reduced form
//! holding only the address→symbol pairs, sorted by address descending so
//! lookups can stream the file once. Both forms are handled here.
//!
//! Lookup never aborts a request: malformed content surfaces as an error the
//! caller logs, and any symbols matched before the bad line are kept.

use std::collections::HashMap;
use std::io::BufRead;

use crate::error::SymbolError;
use crate::models::response::hex;

/// First line of the preprocessed format.
pub const PREPROCESSED_HEADER: &str = "DiskCache v.1";

/// Parse upstream Breakpad text into the preprocessed format.
///
/// Only `PUBLIC <addr> <parm> <name>` and `FUNC <addr> <size> <parm> <name>`
/// lines contribute. A PUBLIC record wins over a FUNC record at the same
/// address. Short or unparsable lines are logged and skipped; `source_id`
/// names the file in those messages.
pub fn preprocess(data: &[u8], source_id: &str) -> String {
    let text = String::from_utf8_lossy(data);
    let mut public_symbols: HashMap<u64, &str> = HashMap::new();
    let mut func_symbols: HashMap<u64, &str> = HashMap::new();

    for (line_num, line) in text.lines().enumerate() {
        let line_num = line_num + 1;
        if let Some(rest) = line.strip_prefix("PUBLIC ") {
            let fields: Vec<&str> = rest.trim_end().splitn(3, ' ').collect();
            match parse_record(&fields, 3) {
                Some((address, symbol)) => {
                    public_symbols.insert(address, symbol);
                }
                None => {
                    tracing::warn!("PUBLIC line {line_num} in {source_id} is malformed");
                }
            }
        } else if let Some(rest) = line.strip_prefix("FUNC ") {
            let fields: Vec<&str> = rest.trim_end().splitn(4, ' ').collect();
            match parse_record(&fields, 4) {
                Some((address, symbol)) => {
                    func_symbols.insert(address, symbol);
                }
                None => {
                    tracing::warn!("FUNC line {line_num} in {source_id} is malformed");
                }
            }
        }
    }

    // PUBLIC records overwrite FUNC records
    let mut merged = func_symbols;
    merged.extend(public_symbols);

    let mut addresses: Vec<u64> = merged.keys().copied().collect();
    addresses.sort_unstable_by(|a, b| b.cmp(a));

    let mut out = String::with_capacity(addresses.len() * 32 + PREPROCESSED_HEADER.len() + 1);
    out.push_str(PREPROCESSED_HEADER);
    out.push('\n');
    for address in addresses {
        out.push_str(&hex(address));
        out.push(' ');
        out.push_str(merged[&address]);
        out.push('\n');
    }
    out
}

/// Extract `(address, symbol)` from the fields following a record keyword.
/// `expected` is the field count after the keyword; the symbol is the final
/// field and may contain spaces.
fn parse_record<'a>(fields: &[&'a str], expected: usize) -> Option<(u64, &'a str)> {
    if fields.len() < expected {
        return None;
    }
    let address = parse_hex(fields[0])?;
    Some((address, fields[expected - 1]))
}

fn parse_hex(field: &str) -> Option<u64> {
    let digits = field.strip_prefix("0x").unwrap_or(field);
    u64::from_str_radix(digits, 16).ok()
}

/// Resolve `offsets` against an open symbol file, inserting matches into
/// `symbols`. The format is detected from the first line; an unrecognised
/// header yields `SymbolError::UnknownFormat` and no symbols.
pub fn read_symbols<R: BufRead>(
    mut reader: R,
    source_id: &str,
    offsets: &[u64],
    symbols: &mut HashMap<u64, String>,
) -> Result<(), SymbolError> {
    if offsets.is_empty() {
        return Ok(());
    }

    let mut first_line = String::new();
    if reader.read_line(&mut first_line)? == 0 {
        return Err(SymbolError::UnknownFormat(source_id.to_string()));
    }
    let first_line = first_line.trim_end();

    if first_line == PREPROCESSED_HEADER {
        read_preprocessed(reader, source_id, offsets, symbols)
    } else if first_line.starts_with("MODULE ") {
        read_raw(reader, source_id, offsets, symbols)
    } else {
        Err(SymbolError::UnknownFormat(source_id.to_string()))
    }
}

/// Preprocessed lookup: addresses stream in descending order, offsets are
/// consumed in descending order. The first line whose address is ≤ the
/// current offset resolves it (and possibly the following offsets too).
fn read_preprocessed<R: BufRead>(
    reader: R,
    source_id: &str,
    offsets: &[u64],
    symbols: &mut HashMap<u64, String>,
) -> Result<(), SymbolError> {
    let mut remaining: Vec<u64> = offsets.to_vec();
    remaining.sort_unstable_by(|a, b| b.cmp(a));
    let mut remaining = remaining.into_iter();
    let mut next_offset = match remaining.next() {
        Some(offset) => offset,
        None => return Ok(()),
    };

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (address, symbol) = line.split_once(' ').ok_or(SymbolError::MalformedLine {
            source_id: source_id.to_string(),
            line: line_num + 2,
        })?;
        let address = parse_hex(address).ok_or(SymbolError::MalformedLine {
            source_id: source_id.to_string(),
            line: line_num + 2,
        })?;

        while address <= next_offset {
            symbols.insert(next_offset, symbol.to_string());
            match remaining.next() {
                Some(offset) => next_offset = offset,
                None => return Ok(()),
            }
        }
    }
    Ok(())
}

/// Raw Breakpad lookup: one pass over PUBLIC/FUNC lines keeping, per offset,
/// the closest address at or below it. PUBLIC wins a tie at equal address.
fn read_raw<R: BufRead>(
    reader: R,
    source_id: &str,
    offsets: &[u64],
    symbols: &mut HashMap<u64, String>,
) -> Result<(), SymbolError> {
    struct Candidate {
        offset: u64,
        closest: Option<u64>,
        from_public: bool,
    }

    let mut candidates: Vec<Candidate> = offsets
        .iter()
        .map(|&offset| Candidate {
            offset,
            closest: None,
            from_public: false,
        })
        .collect();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        let line_num = line_num + 2;

        let record = if let Some(rest) = line.strip_prefix("PUBLIC ") {
            let fields: Vec<&str> = rest.trim_end().splitn(3, ' ').collect();
            match parse_record(&fields, 3) {
                Some((address, symbol)) => Some((address, symbol, true)),
                None => {
                    tracing::warn!("PUBLIC line {line_num} in {source_id} is malformed");
                    None
                }
            }
        } else if let Some(rest) = line.strip_prefix("FUNC ") {
            let fields: Vec<&str> = rest.trim_end().splitn(4, ' ').collect();
            match parse_record(&fields, 4) {
                Some((address, symbol)) => Some((address, symbol, false)),
                None => {
                    tracing::warn!("FUNC line {line_num} in {source_id} is malformed");
                    None
                }
            }
        } else {
            None
        };

        let Some((address, symbol, is_public)) = record else {
            continue;
        };

        for candidate in &mut candidates {
            if address > candidate.offset {
                continue;
            }
            let better = match candidate.closest {
                None => true,
                Some(closest) => {
                    address > closest
                        || (address == closest && is_public && !candidate.from_public)
                }
            };
            if better {
                candidate.closest = Some(address);
                candidate.from_public = is_public;
                symbols.insert(candidate.offset, symbol.to_string());
            }
        }
    }
    Ok(())
}
