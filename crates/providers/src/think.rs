//! Streaming splitter for inline `<think>...</think>` reasoning.
//!
//! Some chat-completions models put their reasoning inline in the content
//! stream. The splitter routes it to a separate reasoning channel, even when
//! a tag is cut in half by chunk boundaries.

const OPEN: &str = "<think>";
const CLOSE: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Text(String),
    Reasoning(String),
}

#[derive(Debug, Default)]
pub(crate) struct ThinkSplitter {
    in_think: bool,
    pending: String,
}

impl ThinkSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Segment> {
        self.pending.push_str(chunk);
        let mut out = Vec::new();

        loop {
            let tag = if self.in_think { CLOSE } else { OPEN };
            if let Some(pos) = self.pending.find(tag) {
                let before: String = self.pending.drain(..pos).collect();
                self.emit(&mut out, before);
                self.pending.drain(..tag.len());
                self.in_think = !self.in_think;
                continue;
            }

            // Hold back a suffix that could be the start of the tag
            let keep = partial_tag_len(&self.pending, tag);
            let ready_len = self.pending.len() - keep;
            let ready: String = self.pending.drain(..ready_len).collect();
            self.emit(&mut out, ready);
            break;
        }

        out
    }

    /// Flush whatever is held back at end of stream.
    pub fn finish(&mut self) -> Vec<Segment> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.pending);
        self.emit(&mut out, rest);
        out
    }

    fn emit(&self, out: &mut Vec<Segment>, s: String) {
        if s.is_empty() {
            return;
        }
        out.push(if self.in_think {
            Segment::Reasoning(s)
        } else {
            Segment::Text(s)
        });
    }
}

/// Length of the longest suffix of `s` that is a proper prefix of `tag`.
fn partial_tag_len(s: &str, tag: &str) -> usize {
    let max = (tag.len() - 1).min(s.len());
    (1..=max)
        .rev()
        .find(|&k| {
            let start = s.len() - k;
            s.is_char_boundary(start) && tag.starts_with(&s[start..])
        })
        .unwrap_or(0)
}
