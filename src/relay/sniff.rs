//! "Maybe JSON" body heuristic.
//!
//! Looks only at the first and the most recent chunk of the decoded body:
//! the first non-whitespace byte must open an object or array, the last
//! non-whitespace byte of the final chunk must close one. Advisory only.

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct JsonSniffer {
    opened: Option<bool>,
    last: Option<Bytes>,
    size: u64,
}

impl JsonSniffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, chunk: &Bytes) {
        if chunk.is_empty() {
            return;
        }
        if self.opened.is_none() {
            let first = chunk.iter().find(|b| !b.is_ascii_whitespace());
            self.opened = Some(matches!(first, Some(b'{') | Some(b'[')));
        }
        self.size += chunk.len() as u64;
        self.last = Some(chunk.clone());
    }

    /// Total bytes observed.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Final verdict once the stream has ended.
    pub fn verdict(&self) -> bool {
        if self.opened != Some(true) {
            return false;
        }
        let closing = self
            .last
            .as_ref()
            .and_then(|chunk| chunk.iter().rev().find(|b| !b.is_ascii_whitespace()));
        matches!(closing, Some(b'}') | Some(b']'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sniff(chunks: &[&'static str]) -> (bool, u64) {
        let mut sniffer = JsonSniffer::new();
        for &chunk in chunks {
            sniffer.observe(&Bytes::from_static(chunk.as_bytes()));
        }
        (sniffer.verdict(), sniffer.size())
    }

    #[test]
    fn object_and_array_bodies() {
        assert_eq!(sniff(&["{\"a\":1}"]), (true, 7));
        assert_eq!(sniff(&["  [1,", "2]\n"]), (true, 8));
    }

    #[test]
    fn non_json_bodies() {
        assert!(!sniff(&["<html></html>"]).0);
        assert!(!sniff(&["{\"truncated\": "]).0);
        assert!(!sniff(&[]).0);
    }

    #[test]
    fn only_the_last_chunk_decides_the_ending() {
        // the closing brace sits in an earlier chunk; the last one is trailing text
        assert!(!sniff(&["{\"a\":1}", " trailing"]).0);
    }

    #[test]
    fn empty_chunks_are_ignored() {
        assert_eq!(sniff(&["", "[]", ""]), (true, 2));
    }
}
