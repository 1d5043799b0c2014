//! Book integrity checksum
//!
//! The exchange periodically sends a CRC-32 of its own top-25 book. We build
//! the same canonical string from local state, interleaving bid and ask
//! ranks (`bid_p:bid_a:ask_p:-ask_a:...`), and compare.

use rust_decimal::Decimal;

use super::engine::{BookState, Side, BOOK_DEPTH};

const DELIMITER: char = ':';

/// Magnitudes below this are rendered in exponent form.
const EXPONENT_THRESHOLD: Decimal = Decimal::from_parts(1, 0, 0, false, 6);

/// Local book disagrees with the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub expected: i32,
    pub computed: i32,
}

impl std::fmt::Display for ChecksumMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "checksum mismatch: exchange={} local={}",
            self.expected, self.computed
        )
    }
}

impl std::error::Error for ChecksumMismatch {}

/// Canonical `price:amount` string over the top [`BOOK_DEPTH`] ranks.
///
/// Ask amounts are negated, matching the wire sign convention. Numbers are
/// rendered without trailing zeros (`2.0` becomes `2`).
pub fn canonical_string(book: &BookState) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(BOOK_DEPTH * 4);

    for rank in 0..BOOK_DEPTH {
        if let Some(bid) = book.level_at(Side::Bid, rank) {
            parts.push(render(bid.price));
            parts.push(render(bid.amount));
        }
        if let Some(ask) = book.level_at(Side::Ask, rank) {
            parts.push(render(ask.price));
            parts.push(render(-ask.amount));
        }
    }

    parts.join(&DELIMITER.to_string())
}

/// Signed CRC-32 of the canonical string, as the exchange reports it.
pub fn compute(book: &BookState) -> i32 {
    crc32(canonical_string(book).as_bytes()) as i32
}

/// Compare local state against the exchange value.
pub fn validate(book: &BookState, expected: i32) -> Result<(), ChecksumMismatch> {
    let computed = compute(book);
    if computed == expected {
        Ok(())
    } else {
        Err(ChecksumMismatch { expected, computed })
    }
}

/// Shortest decimal text as the exchange prints it: plain notation, except
/// non-zero magnitudes below 1e-6 which use exponent form (`1e-8`,
/// `-1.25e-7`).
fn render(value: Decimal) -> String {
    let value = value.normalize();
    if value.is_zero() || value.abs() >= EXPONENT_THRESHOLD {
        return value.to_string();
    }

    let mantissa = value.mantissa();
    let digits = mantissa.unsigned_abs().to_string();
    let exponent = digits.len() as i64 - 1 - i64::from(value.scale());
    let sign = if mantissa < 0 { "-" } else { "" };
    let (lead, rest) = digits.split_at(1);

    if rest.is_empty() {
        format!("{sign}{lead}e{exponent}")
    } else {
        format!("{sign}{lead}.{rest}e{exponent}")
    }
}

/// CRC-32 (IEEE polynomial)
pub fn crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = generate_crc32_table();

    let mut crc = 0xFFFFFFFF_u32;
    for &byte in data {
        let idx = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = CRC32_TABLE[idx] ^ (crc >> 8);
    }
    !crc
}

/// Generate CRC32 lookup table at compile time
const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0usize;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = 0xEDB88320 ^ (crc >> 1);
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}
