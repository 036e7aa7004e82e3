// File: src/lexer.rs
//
// Hand-rolled tokenizer for the bundled front end. The bytecode core (§1 of
// the spec) treats lexing/parsing as an external collaborator — any front end
// that builds `ast::Program` the way `parser.rs` does works identically —
// but a concrete one is bundled so `compile`/`eval` have something to run
// end to end.

use crate::errors::SourceLocation;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Keyword(String),
    /// Operators and punctuation, matched longest-first (see `tokenize`).
    Symbol(String),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub pos: SourceLocation,
}

const KEYWORDS: &[&str] = &[
    "let", "const", "function", "return", "throw", "if", "else", "switch", "case", "default",
    "try", "catch", "finally", "while", "for", "in", "break", "continue", "true", "false", "nil",
];

/// Longest-match-first so `==` is never split into two `=` tokens, etc.
const SYMBOLS: &[&str] = &[
    "...", "??", "?.", "**=", "<<=", ">>=", "==", "!=", "<=", ">=", "&&", "||", "**", "<<", ">>",
    "+=", "-=", "*=", "/=", "%=", "(", ")", "{", "}", "[", "]", ",", ";", ":", "?", ".", "=", "+",
    "-", "*", "/", "%", "&", "^", "|", "<", ">", "!",
];

pub fn tokenize(source: &str) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    let mut line = 1u32;
    let mut col = 1u32;

    let advance = |i: &mut usize, line: &mut u32, col: &mut u32, chars: &[char]| {
        if chars[*i] == '\n' {
            *line += 1;
            *col = 1;
        } else {
            *col += 1;
        }
        *i += 1;
    };

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => advance(&mut i, &mut line, &mut col, &chars),
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    advance(&mut i, &mut line, &mut col, &chars);
                }
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    advance(&mut i, &mut line, &mut col, &chars);
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                advance(&mut i, &mut line, &mut col, &chars);
                advance(&mut i, &mut line, &mut col, &chars);
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    advance(&mut i, &mut line, &mut col, &chars);
                }
                if i < chars.len() {
                    advance(&mut i, &mut line, &mut col, &chars);
                    advance(&mut i, &mut line, &mut col, &chars);
                }
            }
            '"' => {
                let (start_line, start_col) = (line, col);
                advance(&mut i, &mut line, &mut col, &chars);
                let mut s = String::new();
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        advance(&mut i, &mut line, &mut col, &chars);
                        let esc = chars[i];
                        s.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            '\\' => '\\',
                            '"' => '"',
                            '0' => '\0',
                            other => other,
                        });
                        advance(&mut i, &mut line, &mut col, &chars);
                    } else {
                        s.push(chars[i]);
                        advance(&mut i, &mut line, &mut col, &chars);
                    }
                }
                if i < chars.len() {
                    advance(&mut i, &mut line, &mut col, &chars); // closing quote
                }
                tokens.push(Token { kind: TokenKind::Str(s), pos: SourceLocation::new(start_line, start_col) });
            }
            '0'..='9' => {
                let (start_line, start_col) = (line, col);
                let mut num = String::new();
                let mut is_float = false;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    num.push(chars[i]);
                    advance(&mut i, &mut line, &mut col, &chars);
                }
                if i < chars.len() && chars[i] == '.' && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
                    is_float = true;
                    num.push('.');
                    advance(&mut i, &mut line, &mut col, &chars);
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        num.push(chars[i]);
                        advance(&mut i, &mut line, &mut col, &chars);
                    }
                }
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    is_float = true;
                    num.push(chars[i]);
                    advance(&mut i, &mut line, &mut col, &chars);
                    if i < chars.len() && (chars[i] == '+' || chars[i] == '-') {
                        num.push(chars[i]);
                        advance(&mut i, &mut line, &mut col, &chars);
                    }
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        num.push(chars[i]);
                        advance(&mut i, &mut line, &mut col, &chars);
                    }
                }
                let pos = SourceLocation::new(start_line, start_col);
                if is_float {
                    tokens.push(Token { kind: TokenKind::Float(num.parse().unwrap_or(0.0)), pos });
                } else {
                    tokens.push(Token { kind: TokenKind::Int(num.parse().unwrap_or(0)), pos });
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let (start_line, start_col) = (line, col);
                let mut ident = String::new();
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    ident.push(chars[i]);
                    advance(&mut i, &mut line, &mut col, &chars);
                }
                let pos = SourceLocation::new(start_line, start_col);
                let kind = if KEYWORDS.contains(&ident.as_str()) {
                    TokenKind::Keyword(ident)
                } else {
                    TokenKind::Ident(ident)
                };
                tokens.push(Token { kind, pos });
            }
            _ => {
                let (start_line, start_col) = (line, col);
                let rest: String = chars[i..(i + 3).min(chars.len())].iter().collect();
                let matched = SYMBOLS.iter().find(|s| rest.starts_with(*s));
                match matched {
                    Some(sym) => {
                        for _ in 0..sym.chars().count() {
                            advance(&mut i, &mut line, &mut col, &chars);
                        }
                        tokens.push(Token {
                            kind: TokenKind::Symbol(sym.to_string()),
                            pos: SourceLocation::new(start_line, start_col),
                        });
                    }
                    None => advance(&mut i, &mut line, &mut col, &chars),
                }
            }
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, pos: SourceLocation::new(line, col) });
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_arithmetic() {
        let toks = tokenize("1 + 2 * 3");
        let kinds: Vec<&TokenKind> = toks.iter().map(|t| &t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                &TokenKind::Int(1),
                &TokenKind::Symbol("+".to_string()),
                &TokenKind::Int(2),
                &TokenKind::Symbol("*".to_string()),
                &TokenKind::Int(3),
                &TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn longest_match_wins_for_comparison_operators() {
        let toks = tokenize("a <= b");
        assert!(toks.iter().any(|t| t.kind == TokenKind::Symbol("<=".to_string())));
    }

    #[test]
    fn keywords_are_distinguished_from_identifiers() {
        let toks = tokenize("let x");
        assert_eq!(toks[0].kind, TokenKind::Keyword("let".to_string()));
        assert_eq!(toks[1].kind, TokenKind::Ident("x".to_string()));
    }
}
