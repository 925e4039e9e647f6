//! Glob patterns over cache keys.
//!
//! Two dialects exist:
//! - **key globs** supplied by callers and rules: `*` matches any sequence,
//!   `?` any single character, everything else is literal;
//! - **store patterns** understood by the shared tier's `SCAN ... MATCH`,
//!   where `[`, `]` and `\` are also special and must be escaped.
//!
//! Globs are compiled into anchored regular expressions. Literal runs are
//! escaped *before* the wildcards are substituted, so characters like `.`,
//! `(` or `+` in a key never acquire regex meaning. The `regex` crate runs in
//! time linear in the input, so adversarial keys cannot trigger backtracking.

use regex::{Regex, RegexBuilder};

use crate::error::{CacheError, Result};

/// Upper bound on a compiled pattern's program size.
const PATTERN_SIZE_LIMIT: usize = 1 << 22;

/// Compile a key glob into an anchored regex.
pub fn compile_glob(glob: &str) -> Result<Regex> {
    let mut source = String::with_capacity(glob.len() * 2 + 2);
    source.push('^');
    let mut literal = String::new();
    let mut previous_star = false;

    for ch in glob.chars() {
        match ch {
            '*' => {
                flush_literal(&mut source, &mut literal);
                // Consecutive stars are equivalent to one.
                if !previous_star {
                    source.push_str(".*");
                }
                previous_star = true;
                continue;
            }
            '?' => {
                flush_literal(&mut source, &mut literal);
                source.push('.');
            }
            other => literal.push(other),
        }
        previous_star = false;
    }
    flush_literal(&mut source, &mut literal);
    source.push('$');

    RegexBuilder::new(&source)
        .dot_matches_new_line(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
        .map_err(|e| CacheError::configuration(format!("invalid key pattern {glob:?}: {e}")))
}

fn flush_literal(source: &mut String, literal: &mut String) {
    if !literal.is_empty() {
        source.push_str(&regex::escape(literal));
        literal.clear();
    }
}

/// True when the glob contains no wildcard at all.
pub fn is_literal(glob: &str) -> bool {
    !glob.contains(['*', '?'])
}

/// Translate a key glob into a shared-tier MATCH pattern.
pub fn to_store_pattern(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len());
    for ch in glob.chars() {
        if matches!(ch, '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Escape a literal (such as a key prefix) for use inside a MATCH pattern.
pub fn escape_store_literal(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for ch in literal.chars() {
        if matches!(ch, '[' | ']' | '\\' | '*' | '?') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

/// Compile a shared-tier MATCH pattern (with backslash escapes) into a regex.
///
/// Used by in-process store implementations that have to emulate MATCH.
pub fn compile_store_pattern(pattern: &str) -> Result<Regex> {
    let mut source = String::with_capacity(pattern.len() * 2 + 2);
    source.push('^');
    let mut literal = String::new();
    let mut chars = pattern.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some(escaped) => literal.push(escaped),
                None => literal.push('\\'),
            },
            '*' => {
                flush_literal(&mut source, &mut literal);
                source.push_str(".*");
            }
            '?' => {
                flush_literal(&mut source, &mut literal);
                source.push('.');
            }
            other => literal.push(other),
        }
    }
    flush_literal(&mut source, &mut literal);
    source.push('$');

    RegexBuilder::new(&source)
        .dot_matches_new_line(true)
        .size_limit(PATTERN_SIZE_LIMIT)
        .build()
        .map_err(|e| CacheError::configuration(format!("invalid store pattern {pattern:?}: {e}")))
}
