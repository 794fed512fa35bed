//! Sentence-level partials assembled from streamed tokens.

/// Buffers streamed text and cuts it at configured separators.
#[derive(Debug, Clone, Default)]
pub struct PartialSplitter {
    separators: Vec<String>,
    buffer: String,
}

impl PartialSplitter {
    pub fn new(separators: &[String]) -> Self {
        Self {
            separators: separators.iter().filter(|s| !s.is_empty()).cloned().collect(),
            buffer: String::new(),
        }
    }

    /// Feed a fragment; returns every partial it completed, trimmed.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        let mut out = Vec::new();
        if self.separators.is_empty() {
            return out;
        }
        self.buffer.push_str(fragment);

        while let Some(end) = self.earliest_separator_end() {
            let piece: String = self.buffer.drain(..end).collect();
            if let Some(p) = self.meaningful(&piece) {
                out.push(p);
            }
        }
        out
    }

    /// Whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        self.meaningful(&rest)
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Byte offset just past the earliest separator in the buffer.
    fn earliest_separator_end(&self) -> Option<usize> {
        self.separators
            .iter()
            .filter_map(|sep| self.buffer.find(sep.as_str()).map(|i| (i, i + sep.len())))
            .min_by_key(|&(start, _)| start)
            .map(|(_, end)| end)
    }

    /// Trimmed piece, or `None` if it is blank or only separators.
    fn meaningful(&self, piece: &str) -> Option<String> {
        let trimmed = piece.trim();
        let mut rest = trimmed;
        while let Some(sep) = self.separators.iter().find(|s| rest.starts_with(s.as_str())) {
            rest = rest[sep.len()..].trim_start();
        }
        if rest.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn splitter() -> PartialSplitter {
        PartialSplitter::new(&[".".to_string(), "?".to_string(), "!".to_string()])
    }

    #[test]
    fn test_splits_across_fragments() {
        let mut s = splitter();
        assert!(s.push("Hel").is_empty());
        assert_eq!(s.push("lo. How"), vec!["Hello."]);
        assert_eq!(s.push(" are you? Fine"), vec!["How are you?"]);
        assert_eq!(s.finish().as_deref(), Some("Fine"));
        assert_eq!(s.finish(), None);
    }

    #[test]
    fn test_earliest_separator_wins() {
        let mut s = splitter();
        assert_eq!(s.push("Wow! Really. "), vec!["Wow!", "Really."]);
    }

    #[test]
    fn test_separator_only_pieces_are_dropped() {
        let mut s = splitter();
        assert_eq!(s.push("Wait... ok!"), vec!["Wait.", "ok!"]);
    }

    #[test]
    fn test_no_separators_never_emits() {
        let mut s = PartialSplitter::new(&[]);
        assert!(s.push("a. b. c.").is_empty());
    }
}
