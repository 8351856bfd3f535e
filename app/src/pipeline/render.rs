/// What a newline-bearing fragment is rendered as
pub const PARAGRAPH_BREAK: &str = "\n\n";

/// Folds runs of newline fragments into one paragraph break.
///
/// Holds per-request state: reset it whenever a new request starts so a
/// break at the end of one reply does not swallow one at the start of the
/// next.
#[derive(Debug, Default)]
pub struct LineBreakCollapser {
    last_was_linebreak: bool,
}

impl LineBreakCollapser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text to append for `fragment`, or `None` to drop it.
    pub fn push(&mut self, fragment: &str) -> Option<String> {
        if fragment.contains('\n') {
            if self.last_was_linebreak {
                return None;
            }
            self.last_was_linebreak = true;
            return Some(PARAGRAPH_BREAK.to_string());
        }

        self.last_was_linebreak = false;
        Some(fragment.to_string())
    }

    pub fn reset(&mut self) {
        self.last_was_linebreak = false;
    }
}
