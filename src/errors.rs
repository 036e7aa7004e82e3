// File: src/errors.rs
//
// Error handling and reporting for the scripting core.
// Provides structured, positioned error types for both compile-time and
// run-time failures, plus "did you mean" suggestion helpers shared by both.

use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file.
///
/// One location is recorded per emitted instruction (see `bytecode::Code::location_at`);
/// `end_column == 0` means "unset or spans multiple lines".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
    pub end_column: u32,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column, end_column: 0 }
    }

    pub fn with_end(line: u32, column: u32, end_column: u32) -> Self {
        Self { line, column, end_column }
    }

    /// The zero sentinel returned for out-of-range instruction indices.
    pub fn zero() -> Self {
        Self { line: 0, column: 0, end_column: 0 }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Render a positioned diagnostic the way the rest of this crate's error types do:
/// a colored "kind: message" header, a `-->` filename:line:column line, the offending
/// source line with a caret under the column, and optional help/suggestion/note
/// footers. Shared by `CompileError` and `RuntimeError` so both surfaces look alike.
#[allow(clippy::too_many_arguments)]
pub fn render_diagnostic(
    f: &mut fmt::Formatter<'_>,
    kind: &str,
    message: &str,
    filename: &str,
    location: SourceLocation,
    source_line: Option<&str>,
    suggestion: Option<&str>,
    help: Option<&str>,
    note: Option<&str>,
) -> fmt::Result {
    writeln!(f, "{}: {}", kind.red().bold(), message.bold())?;
    writeln!(f, "{}", format!("  --> {}:{}", filename, location).bright_blue())?;

    if let Some(source) = source_line {
        let line_num = location.line;
        let col_num = location.column.max(1);
        writeln!(f, "   {}", "|".bright_blue())?;
        writeln!(
            f,
            "{} {} {}",
            format!("{:>3}", line_num).bright_blue(),
            "|".bright_blue(),
            source
        )?;
        writeln!(
            f,
            "   {} {}{}",
            "|".bright_blue(),
            " ".repeat((col_num as usize).saturating_sub(1)),
            "^".red().bold()
        )?;
        writeln!(f, "   {}", "|".bright_blue())?;
    }

    if let Some(help) = help {
        writeln!(f, "   {} {}", "=".bright_yellow(), format!("help: {}", help).bright_yellow())?;
    }
    if let Some(suggestion) = suggestion {
        writeln!(
            f,
            "   {} {}",
            "=".bright_green(),
            format!("did you mean '{}'?", suggestion).bright_green()
        )?;
    }
    if let Some(note) = note {
        writeln!(f, "   {} {}", "=".bright_cyan(), format!("note: {}", note).bright_cyan())?;
    }
    Ok(())
}

/// Computes the Levenshtein distance between two strings.
/// Used for "did you mean?" suggestions in `UndefinedName` errors.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0usize; len2 + 1]; len1 + 1];
    for (i, row) in matrix.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for (j, cell) in matrix[0].iter_mut().enumerate().take(len2 + 1) {
        *cell = j;
    }

    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            matrix[i][j] = std::cmp::min(
                std::cmp::min(matrix[i - 1][j] + 1, matrix[i][j - 1] + 1),
                matrix[i - 1][j - 1] + cost,
            );
        }
    }

    matrix[len1][len2]
}

/// Finds the closest match from a list of candidates using Levenshtein distance.
/// Returns `None` if nothing within distance 3 is found.
pub fn find_closest_match<'a>(target: &str, candidates: &'a [String]) -> Option<&'a str> {
    let mut best_match = None;
    let mut best_distance = usize::MAX;

    for candidate in candidates {
        let distance = levenshtein_distance(target, candidate);
        if distance <= 3 && distance < best_distance {
            best_distance = distance;
            best_match = Some(candidate.as_str());
        }
    }

    best_match
}
