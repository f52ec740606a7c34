//! Console markup stripping.
//!
//! Build logs carry inline terminal escape sequences (colors, cursor moves,
//! hyperlink OSC codes). Matched text is stripped before hashing and storage
//! so downstream consumers always see plain text.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

/// CSI sequences (`ESC [ ... cmd`), OSC sequences (`ESC ] ... BEL`/`ESC \`),
/// and the remaining two-byte escapes.
static CONSOLE_MARKUP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-_]")
        .unwrap()
});

/// Strip console markup from a line of log text.
///
/// Returns a borrowed slice when the line is already clean, which is the
/// common case for most build logs.
pub fn strip(line: &str) -> Cow<'_, str> {
    CONSOLE_MARKUP.replace_all(line, "")
}
