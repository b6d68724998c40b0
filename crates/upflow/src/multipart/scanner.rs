//! Cross-chunk boundary scanner
//!
//! Finds every occurrence of the delimiter `"--" ++ token` in a stream of
//! arbitrarily sized chunks. A tail of `min(|delimiter| - 1, len)` bytes is
//! carried over between scans so a delimiter split across two chunks is
//! found on the next call.

use bytes::{Bytes, BytesMut};
use memchr::memmem;

/// A delimiter occurrence and the data that preceded it.
#[derive(Debug)]
pub struct ScanPart {
    /// Bytes between the previous delimiter (or scan start) and this one.
    pub data: Bytes,
    /// Offset of the delimiter in the concatenated carryover + chunk buffer.
    pub boundary_index: usize,
}

/// Result of a single [`BoundaryScanner::scan`] call.
#[derive(Debug)]
pub struct ScanOutcome {
    /// One entry per delimiter found, in order.
    pub parts: Vec<ScanPart>,
    /// Bytes after the last delimiter that are safe to release downstream.
    pub emit: Bytes,
}

pub struct BoundaryScanner {
    finder: memmem::Finder<'static>,
    needle_len: usize,
    carryover: Vec<u8>,
}

impl BoundaryScanner {
    /// `token` is the boundary token from the `Content-Type` header; the
    /// scanner searches for `"--" ++ token`.
    #[must_use]
    pub fn new(token: &[u8]) -> Self {
        let mut needle = Vec::with_capacity(token.len() + 2);
        needle.extend_from_slice(b"--");
        needle.extend_from_slice(token);
        let needle_len = needle.len();
        Self {
            finder: memmem::Finder::new(&needle).into_owned(),
            needle_len,
            carryover: Vec::new(),
        }
    }

    /// Length of the full delimiter, including the leading `--`.
    #[must_use]
    pub fn delimiter_len(&self) -> usize {
        self.needle_len
    }

    /// Scans `carryover ++ chunk` for delimiter occurrences.
    pub fn scan(&mut self, chunk: &[u8]) -> ScanOutcome {
        let buf = if self.carryover.is_empty() {
            Bytes::copy_from_slice(chunk)
        } else {
            let mut merged = BytesMut::with_capacity(self.carryover.len() + chunk.len());
            merged.extend_from_slice(&self.carryover);
            merged.extend_from_slice(chunk);
            self.carryover.clear();
            merged.freeze()
        };

        let mut parts = Vec::new();
        let mut start = 0;
        for pos in self.finder.find_iter(&buf) {
            // find_iter yields non-overlapping matches left to right; a match
            // starting before `start` would overlap the previous delimiter
            debug_assert!(pos >= start);
            parts.push(ScanPart {
                data: buf.slice(start..pos),
                boundary_index: pos,
            });
            start = pos + self.needle_len;
        }

        let tail_len = buf.len() - start;
        let keep = usize::min(self.needle_len - 1, tail_len);
        let emit = buf.slice(start..buf.len() - keep);
        self.carryover.extend_from_slice(&buf[buf.len() - keep..]);

        ScanOutcome { parts, emit }
    }

    /// Returns and clears the retained carryover at end of input.
    pub fn flush(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.carryover))
    }

    /// Clears the retained carryover.
    pub fn reset(&mut self) {
        self.carryover.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(scanner: &mut BoundaryScanner, chunks: &[&[u8]]) -> (Vec<usize>, Vec<u8>) {
        let mut indices = Vec::new();
        let mut data = Vec::new();
        let mut consumed = 0;
        for chunk in chunks {
            let held = scanner.carryover.len();
            let out = scanner.scan(chunk);
            for part in out.parts {
                data.extend_from_slice(&part.data);
                // translate to an absolute offset in the full input
                indices.push(consumed - held + part.boundary_index);
            }
            data.extend_from_slice(&out.emit);
            consumed += chunk.len();
        }
        data.extend_from_slice(&scanner.flush());
        (indices, data)
    }

    fn naive_indices(haystack: &[u8], needle: &[u8]) -> Vec<usize> {
        let mut ans = Vec::new();
        let mut start = 0;
        while let Some(pos) = memmem::find(&haystack[start..], needle) {
            ans.push(start + pos);
            start += pos + needle.len();
        }
        ans
    }

    #[test]
    fn single_chunk_matches_naive_search() {
        let body = b"aaa--Xbbb--Xccc";
        let mut scanner = BoundaryScanner::new(b"X");
        let (indices, data) = collect(&mut scanner, &[body]);
        assert_eq!(indices, naive_indices(body, b"--X"));
        assert_eq!(data, b"aaabbbccc");
    }

    #[test]
    fn equivalent_over_any_chunking() {
        let body = b"pre--token1 mid --token2--tokenx--token end".as_slice();
        let expected = naive_indices(body, b"--token");

        for chunk_size in 1..=body.len() {
            let chunks: Vec<&[u8]> = body.chunks(chunk_size).collect();
            let mut scanner = BoundaryScanner::new(b"token");
            let (indices, data) = collect(&mut scanner, &chunks);
            assert_eq!(indices, expected, "chunk_size={chunk_size}");
            // non-delimiter bytes survive exactly once, in order
            let mut residue = body.to_vec();
            let mut removed = 0;
            for &idx in expected.iter() {
                let at = idx - removed;
                residue.drain(at..at + "--token".len());
                removed += "--token".len();
            }
            assert_eq!(data, residue, "chunk_size={chunk_size}");
        }
    }

    #[test]
    fn boundary_split_across_chunks() {
        let mut scanner = BoundaryScanner::new(b"BND");
        let first = scanner.scan(b"data--B");
        assert!(first.parts.is_empty());
        assert_eq!(&first.emit[..], b"dat");

        let second = scanner.scan(b"NDrest");
        assert_eq!(second.parts.len(), 1);
        assert_eq!(&second.parts[0].data[..], b"a");
        assert!(second.emit.is_empty());
        assert_eq!(&scanner.flush()[..], b"rest");
    }

    #[test]
    fn empty_input_yields_nothing() {
        let mut scanner = BoundaryScanner::new(b"B");
        let out = scanner.scan(b"");
        assert!(out.parts.is_empty());
        assert!(out.emit.is_empty());
        assert!(scanner.flush().is_empty());
    }

    #[test]
    fn reset_clears_carryover() {
        let mut scanner = BoundaryScanner::new(b"BOUND");
        let _ = scanner.scan(b"xx--BO");
        scanner.reset();
        assert!(scanner.flush().is_empty());
    }
}
