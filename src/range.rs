//! Byte-range header parsing with server-side chunk clamping.
//!
//! Stream responses never serve a whole file in one request. Every range,
//! explicit or not, is clamped to the configured media chunk size; clients
//! issue successive ranged requests for full playback.

/// An inclusive byte interval `[start, end]`.
pub type ByteRange = (u64, u64);

/// The range served when the client sent no `Range` header: the first chunk.
///
/// Returns `None` for empty files, which have no satisfiable range.
pub fn default_range(size: u64, chunk: u64) -> Option<ByteRange> {
    if size == 0 || chunk == 0 {
        return None;
    }
    Some((0, chunk.min(size) - 1))
}

/// Parse the first part of a `Range` header against a file of `size` bytes,
/// clamping the result to `chunk` bytes.
///
/// Returns `None` when the requested range is not satisfiable; callers
/// respond 416 and never register a transfer.
pub fn parse_byte_range(header: &str, size: u64, chunk: u64) -> Option<ByteRange> {
    if size == 0 || chunk == 0 {
        return None;
    }
    let last = size - 1;

    let spec = match header.strip_prefix("bytes=") {
        Some(s) => s.split(',').next().unwrap_or("").trim(),
        // Unknown unit: fall back to the first chunk.
        None => return default_range(size, chunk),
    };

    let (start_str, end_str) = spec.split_once('-')?;
    let start = parse_part(start_str)?;
    let end = parse_part(end_str)?;

    match (start, end) {
        // "bytes=-" carries no positions; serve the first chunk.
        (None, None) => default_range(size, chunk),
        // Suffix range: the last `n` bytes, clamped to one chunk.
        (None, Some(n)) => {
            if n == 0 || n > size {
                return None;
            }
            let start = size - n;
            Some((start, start.saturating_add(chunk - 1).min(last)))
        }
        // Open-ended range from `start`.
        (Some(start), None) => {
            if start > last {
                return None;
            }
            Some((start, start.saturating_add(chunk - 1).min(last)))
        }
        // Fully specified range, clamped to one chunk.
        (Some(start), Some(end)) => {
            if start > last || end > last || end < start {
                return None;
            }
            Some((start, start.saturating_add(chunk - 1).min(end).min(last)))
        }
    }
}

/// Parse one side of a range spec; empty means absent, non-digits are
/// malformed.
fn parse_part(part: &str) -> Option<Option<u64>> {
    if part.is_empty() {
        return Some(None);
    }
    part.parse::<u64>().ok().map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: u64 = 1000;
    const CHUNK: u64 = 256;

    #[test]
    fn missing_header_yields_first_chunk() {
        assert_eq!(default_range(SIZE, CHUNK), Some((0, 255)));
    }

    #[test]
    fn missing_header_on_small_file_yields_whole_file() {
        assert_eq!(default_range(100, CHUNK), Some((0, 99)));
    }

    #[test]
    fn empty_file_has_no_satisfiable_range() {
        assert_eq!(default_range(0, CHUNK), None);
        assert_eq!(parse_byte_range("bytes=0-10", 0, CHUNK), None);
    }

    #[test]
    fn open_ended_range_is_clipped_and_chunked() {
        // bytes=500- on a 1000-byte file: start at 500, one chunk.
        assert_eq!(parse_byte_range("bytes=500-", SIZE, CHUNK), Some((500, 755)));
        // Near the end the chunk is clipped to the remainder.
        assert_eq!(parse_byte_range("bytes=900-", SIZE, CHUNK), Some((900, 999)));
    }

    #[test]
    fn out_of_bounds_range_is_unsatisfiable() {
        assert_eq!(parse_byte_range("bytes=2000-3000", SIZE, CHUNK), None);
        assert_eq!(parse_byte_range("bytes=1000-", SIZE, CHUNK), None);
        assert_eq!(parse_byte_range("bytes=0-1000", SIZE, CHUNK), None);
    }

    #[test]
    fn explicit_range_is_clamped_to_chunk() {
        assert_eq!(parse_byte_range("bytes=0-999", SIZE, CHUNK), Some((0, 255)));
        // A range smaller than the chunk passes through untouched.
        assert_eq!(parse_byte_range("bytes=10-20", SIZE, CHUNK), Some((10, 20)));
    }

    #[test]
    fn suffix_range_serves_trailing_bytes() {
        assert_eq!(parse_byte_range("bytes=-100", SIZE, CHUNK), Some((900, 999)));
        assert_eq!(parse_byte_range("bytes=-500", SIZE, CHUNK), Some((500, 755)));
        assert_eq!(parse_byte_range("bytes=-0", SIZE, CHUNK), None);
        assert_eq!(parse_byte_range("bytes=-2000", SIZE, CHUNK), None);
    }

    #[test]
    fn inverted_range_is_unsatisfiable() {
        assert_eq!(parse_byte_range("bytes=500-100", SIZE, CHUNK), None);
    }

    #[test]
    fn declared_sizes_near_u64_max_do_not_overflow() {
        // Sizes are uploader-declared and never verified, so the math has
        // to survive the extremes.
        let size = u64::MAX;
        let last = size - 1;
        assert_eq!(
            parse_byte_range("bytes=18446744073709551613-", size, CHUNK),
            Some((size - 2, last))
        );
        assert_eq!(
            parse_byte_range("bytes=-4", size, CHUNK),
            Some((size - 4, last))
        );
        assert_eq!(
            parse_byte_range(
                "bytes=18446744073709551610-18446744073709551614",
                size,
                CHUNK
            ),
            Some((size - 5, last))
        );
    }

    #[test]
    fn malformed_specs_are_rejected() {
        assert_eq!(parse_byte_range("bytes=abc-def", SIZE, CHUNK), None);
        assert_eq!(parse_byte_range("bytes=12", SIZE, CHUNK), None);
    }

    #[test]
    fn unknown_unit_falls_back_to_first_chunk() {
        assert_eq!(parse_byte_range("items=0-10", SIZE, CHUNK), Some((0, 255)));
    }

    #[test]
    fn only_first_part_of_multi_range_is_honored() {
        assert_eq!(
            parse_byte_range("bytes=0-99, 200-299", SIZE, CHUNK),
            Some((0, 99))
        );
    }
}
