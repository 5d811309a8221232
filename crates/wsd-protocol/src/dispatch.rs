//! Dispatch policy and pattern compilation flags.

/// Whether the first matching handler ends dispatch for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchMode {
    /// Every matching pattern handler and every catch-all handler runs.
    #[default]
    All,
    /// Stop at the first pattern match; catch-alls only run when no pattern
    /// matched, and then only the first one.
    One,
}

impl MatchMode {
    pub fn is_match_one(&self) -> bool {
        matches!(self, Self::One)
    }
}

/// Flags applied when compiling a handler pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PatternFlags {
    pub case_insensitive: bool,
    /// `^` and `$` match at line boundaries. The pattern itself stays
    /// anchored to the start of the message.
    pub multi_line: bool,
    pub dot_matches_new_line: bool,
    pub ignore_whitespace: bool,
}

impl PatternFlags {
    pub fn case_insensitive() -> Self {
        Self {
            case_insensitive: true,
            ..Self::default()
        }
    }

    /// Build a regex anchored at the start of the input.
    ///
    /// Outside multi-line mode a bare `$` also matches just before a single
    /// trailing newline, so `^PING$` accepts both `"PING"` and `"PING\n"`.
    /// Inline `(?m)` groups are not detected and get the same rewrite.
    pub fn compile(&self, pattern: &str) -> Result<regex::Regex, regex::Error> {
        let pattern = if self.multi_line {
            pattern.to_owned()
        } else {
            end_allows_trailing_newline(pattern, self.ignore_whitespace)
        };
        // In verbose mode a trailing `#` comment would swallow the closing group.
        let anchored = if self.ignore_whitespace {
            format!("\\A(?:{pattern}\n)")
        } else {
            format!("\\A(?:{pattern})")
        };
        regex::RegexBuilder::new(&anchored)
            .case_insensitive(self.case_insensitive)
            .multi_line(self.multi_line)
            .dot_matches_new_line(self.dot_matches_new_line)
            .ignore_whitespace(self.ignore_whitespace)
            .build()
    }
}

/// Rewrite every `$` outside escapes, character classes, and verbose-mode
/// comments to `(?:\n?\z)`.
fn end_allows_trailing_newline(pattern: &str, verbose: bool) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut class_depth = 0usize;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '[' => {
                class_depth += 1;
                out.push(c);
                if chars.peek() == Some(&'^') {
                    out.push('^');
                    chars.next();
                }
                // A leading `]` is a literal member of the class.
                if chars.peek() == Some(&']') {
                    out.push(']');
                    chars.next();
                }
            }
            ']' if class_depth > 0 => {
                class_depth -= 1;
                out.push(c);
            }
            '#' if verbose && class_depth == 0 => {
                out.push(c);
                for next in chars.by_ref() {
                    out.push(next);
                    if next == '\n' {
                        break;
                    }
                }
            }
            '$' if class_depth == 0 => out.push_str(r"(?:\n?\z)"),
            _ => out.push(c),
        }
    }
    out
}
