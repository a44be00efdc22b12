//! SQL tokenizer for the SQLite dialect subset the binder analyzes
//!
//! The lexer keeps byte offsets so the binder can rewrite named placeholders
//! in place without re-rendering the statement.

use super::BindError;

/// Placeholder forms accepted in templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    /// `:name`, `@name` or `$name`
    Named(String),
    /// `?`
    Anonymous,
    /// `?NNN`
    Numbered(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Bare word: keyword or identifier
    Word(String),
    /// `"x"`, `` `x` `` or `[x]`
    QuotedIdent(String),
    /// `'text'`
    Str(String),
    /// `x'0A'` blob literal
    Blob,
    Number(String),
    Param(Placeholder),
    /// Operators and punctuation: `. , ( ) * ; = <> <= >= || ...`
    Symbol(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte range in the source text
    pub start: usize,
    pub end: usize,
}

impl Token {
    /// Uppercased keyword text for bare words
    pub fn keyword(&self) -> Option<String> {
        match &self.kind {
            TokenKind::Word(w) => Some(w.to_ascii_uppercase()),
            _ => None,
        }
    }

    pub fn is_keyword(&self, kw: &str) -> bool {
        matches!(&self.kind, TokenKind::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    pub fn is_symbol(&self, sym: &str) -> bool {
        matches!(&self.kind, TokenKind::Symbol(s) if *s == sym)
    }

    /// Identifier text for bare or quoted words
    pub fn ident(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Word(w) | TokenKind::QuotedIdent(w) => Some(w),
            _ => None,
        }
    }
}

const SYMBOLS: &[&str] = &[
    "||", "<=", ">=", "<>", "!=", "==", "<<", ">>", "->>", "->", ".", ",", "(", ")", "*", ";", "=",
    "<", ">", "+", "-", "/", "%", "&", "|", "~",
];

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || !c.is_ascii()
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

/// Tokenize `sql`, dropping whitespace and comments
pub fn tokenize(sql: &str) -> Result<Vec<Token>, BindError> {
    let chars: Vec<(usize, char)> = sql.char_indices().collect();
    let byte_at = |i: usize| chars.get(i).map_or(sql.len(), |(b, _)| *b);
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (start, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // -- line comment
        if c == '-' && next == Some('-') {
            while i < chars.len() && chars[i].1 != '\n' {
                i += 1;
            }
            continue;
        }

        // /* block comment */
        if c == '/' && next == Some('*') {
            i += 2;
            loop {
                if i >= chars.len() {
                    return Err(BindError::Syntax("unterminated block comment".to_string()));
                }
                if chars[i].1 == '*' && chars.get(i + 1).map(|(_, c)| *c) == Some('/') {
                    i += 2;
                    break;
                }
                i += 1;
            }
            continue;
        }

        // Blob literal x'..'
        if (c == 'x' || c == 'X') && next == Some('\'') {
            let (_, end) = scan_quoted(&chars, i + 1, '\'')?;
            tokens.push(Token {
                kind: TokenKind::Blob,
                start,
                end: byte_at(end),
            });
            i = end;
            continue;
        }

        if c == '\'' {
            let (text, end) = scan_quoted(&chars, i, '\'')?;
            tokens.push(Token {
                kind: TokenKind::Str(text),
                start,
                end: byte_at(end),
            });
            i = end;
            continue;
        }

        if c == '"' || c == '`' {
            let (text, end) = scan_quoted(&chars, i, c)?;
            tokens.push(Token {
                kind: TokenKind::QuotedIdent(text),
                start,
                end: byte_at(end),
            });
            i = end;
            continue;
        }

        if c == '[' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].1 != ']' {
                j += 1;
            }
            if j >= chars.len() {
                return Err(BindError::Syntax("unterminated [identifier]".to_string()));
            }
            let text: String = chars[i + 1..j].iter().map(|(_, c)| *c).collect();
            tokens.push(Token {
                kind: TokenKind::QuotedIdent(text),
                start,
                end: byte_at(j + 1),
            });
            i = j + 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) {
            let mut j = i;
            while j < chars.len() {
                let ch = chars[j].1;
                let exponent_sign = (ch == '+' || ch == '-')
                    && j > i
                    && matches!(chars[j - 1].1, 'e' | 'E');
                if ch.is_ascii_alphanumeric() || ch == '.' || exponent_sign {
                    j += 1;
                } else {
                    break;
                }
            }
            let text: String = chars[i..j].iter().map(|(_, c)| *c).collect();
            tokens.push(Token {
                kind: TokenKind::Number(text),
                start,
                end: byte_at(j),
            });
            i = j;
            continue;
        }

        if c == '?' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].1.is_ascii_digit() {
                j += 1;
            }
            let placeholder = if j == i + 1 {
                Placeholder::Anonymous
            } else {
                let digits: String = chars[i + 1..j].iter().map(|(_, c)| *c).collect();
                let n = digits
                    .parse::<usize>()
                    .map_err(|_| BindError::Syntax(format!("bad placeholder ?{digits}")))?;
                if n == 0 {
                    return Err(BindError::Syntax("placeholder ?0 is not valid".to_string()));
                }
                Placeholder::Numbered(n)
            };
            tokens.push(Token {
                kind: TokenKind::Param(placeholder),
                start,
                end: byte_at(j),
            });
            i = j;
            continue;
        }

        if (c == ':' || c == '@' || c == '$') && next.is_some_and(is_ident_start) {
            let mut j = i + 1;
            while j < chars.len() && is_ident_char(chars[j].1) {
                j += 1;
            }
            let name: String = chars[i + 1..j].iter().map(|(_, c)| *c).collect();
            tokens.push(Token {
                kind: TokenKind::Param(Placeholder::Named(name)),
                start,
                end: byte_at(j),
            });
            i = j;
            continue;
        }

        if is_ident_start(c) {
            let mut j = i;
            while j < chars.len() && is_ident_char(chars[j].1) {
                j += 1;
            }
            let word: String = chars[i..j].iter().map(|(_, c)| *c).collect();
            tokens.push(Token {
                kind: TokenKind::Word(word),
                start,
                end: byte_at(j),
            });
            i = j;
            continue;
        }

        let rest = &sql[start..];
        match SYMBOLS.iter().copied().find(|s| rest.starts_with(*s)) {
            Some(sym) => {
                let len = sym.chars().count();
                tokens.push(Token {
                    kind: TokenKind::Symbol(sym),
                    start,
                    end: byte_at(i + len),
                });
                i += len;
            }
            None => return Err(BindError::Syntax(format!("unexpected character '{c}'"))),
        }
    }

    Ok(tokens)
}

/// Scan a quoted run starting at `open` (the quote char); doubled quotes
/// escape. Returns the unescaped text and the index after the closing quote.
fn scan_quoted(chars: &[(usize, char)], open: usize, quote: char) -> Result<(String, usize), BindError> {
    let mut text = String::new();
    let mut j = open + 1;
    loop {
        match chars.get(j) {
            None => {
                return Err(BindError::Syntax(format!("unterminated {quote}-quoted literal")));
            }
            Some((_, c)) if *c == quote => {
                if chars.get(j + 1).map(|(_, c)| *c) == Some(quote) {
                    text.push(quote);
                    j += 2;
                } else {
                    return Ok((text, j + 1));
                }
            }
            Some((_, c)) => {
                text.push(*c);
                j += 1;
            }
        }
    }
}
