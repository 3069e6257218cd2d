//! Canned answers for the terminal capability queries agent TUIs send on
//! startup. Without a real terminal on the other side these queries block.

const QUERY_WINDOW_BYTES: usize = 8 * 1024;
const QUERY_COUNT: usize = 5;

struct TerminalQuery {
    name: &'static str,
    patterns: &'static [&'static [u8]],
    reply: &'static [u8],
}

const QUERIES: [TerminalQuery; QUERY_COUNT] = [
    TerminalQuery {
        name: "cursor_position",
        patterns: &[b"\x1b[6n"],
        reply: b"\x1b[1;1R",
    },
    TerminalQuery {
        name: "device_attributes",
        patterns: &[b"\x1b[c", b"\x1b[0c"],
        reply: b"\x1b[?1;2c",
    },
    TerminalQuery {
        name: "keyboard_enhancement",
        patterns: &[b"\x1b[?u"],
        reply: b"\x1b[?0u",
    },
    TerminalQuery {
        name: "foreground_color",
        patterns: &[b"\x1b]10;?"],
        reply: b"\x1b]10;rgb:c7c7/c7c7/c7c7\x1b\\",
    },
    TerminalQuery {
        name: "background_color",
        patterns: &[b"\x1b]11;?"],
        reply: b"\x1b]11;rgb:0000/0000/0000\x1b\\",
    },
];

/// Watches a rolling window of pty output and yields each canned reply the
/// first time its query shows up.
#[derive(Debug, Default)]
pub(crate) struct TerminalQueryResponder {
    window: Vec<u8>,
    answered: [bool; QUERY_COUNT],
}

impl TerminalQueryResponder {
    pub(crate) fn observe(&mut self, chunk: &[u8]) -> Vec<&'static [u8]> {
        self.window.extend_from_slice(chunk);

        let mut replies = Vec::new();
        for (idx, query) in QUERIES.iter().enumerate() {
            if self.answered[idx] {
                continue;
            }
            if query
                .patterns
                .iter()
                .any(|pattern| contains(&self.window, pattern))
            {
                tracing::debug!(query = query.name, "answering terminal query");
                self.answered[idx] = true;
                replies.push(query.reply);
            }
        }

        let excess = self.window.len().saturating_sub(QUERY_WINDOW_BYTES);
        if excess > 0 {
            self.window.drain(..excess);
        }
        replies
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
