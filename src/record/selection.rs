//! Restricted filter grammar for record queries.
//!
//! Callers pass a filter string plus positional arguments. The string is
//! tokenized and parsed before any SQL is built; only the grammar below is
//! accepted:
//!
//! ```text
//! expr     := and_expr ( OR and_expr )*
//! and_expr := term ( AND term )*
//! term     := '(' expr ')'
//!           | column op operand
//!           | column IS [NOT] NULL
//! op       := = | != | <> | < | <= | > | >=
//! operand  := ? | integer | 'quoted text'
//! ```
//!
//! Columns must come from [`ALLOWED_COLUMNS`]. Keywords are case-insensitive.

use super::error::StoreError;
use super::item::StatusBand;

/// Columns that may appear in a selection.
pub const ALLOWED_COLUMNS: &[&str] = &[
    "id",
    "source_uri",
    "destination_policy",
    "hint",
    "local_path",
    "mime_type",
    "status",
    "control",
    "current_bytes",
    "total_bytes",
    "etag",
    "num_failed",
    "last_modification",
    "visibility",
    "extras",
    "no_integrity",
    "wifi_only",
    "created_at",
];

/// Deepest parenthesis nesting a selection may use.
const MAX_NESTING: usize = 64;

/// A positional selection argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionArg {
    /// Integer argument.
    Int(i64),
    /// Text argument.
    Text(String),
}

impl From<i64> for SelectionArg {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for SelectionArg {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for SelectionArg {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// A validated filter clause with its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    clause: Option<String>,
    args: Vec<SelectionArg>,
}

impl Selection {
    /// Selects every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Validates `clause` and pairs it with `args`.
    ///
    /// An empty or whitespace-only clause selects every record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidSelection`] for any token or construct
    /// outside the grammar, and [`StoreError::ArgumentCount`] when the number
    /// of `?` placeholders differs from `args.len()`.
    pub fn parse(clause: &str, args: Vec<SelectionArg>) -> Result<Self, StoreError> {
        let tokens = tokenize(clause)?;
        if tokens.is_empty() {
            if !args.is_empty() {
                return Err(StoreError::ArgumentCount {
                    expected: 0,
                    actual: args.len(),
                });
            }
            return Ok(Self::all());
        }

        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            placeholders: 0,
            depth: 0,
            end_offset: clause.len(),
        };
        parser.expr()?;
        if let Some(extra) = parser.peek() {
            return Err(StoreError::invalid_selection(
                extra.offset,
                "unexpected trailing token",
            ));
        }
        if parser.placeholders != args.len() {
            return Err(StoreError::ArgumentCount {
                expected: parser.placeholders,
                actual: args.len(),
            });
        }

        Ok(Self {
            clause: Some(render(&tokens)),
            args,
        })
    }

    /// Selects records whose status falls in `band`.
    #[must_use]
    pub fn status_band(band: StatusBand) -> Self {
        let (low, high) = match band {
            StatusBand::Pending => (190, 190),
            StatusBand::Running => (191, 199),
            StatusBand::Success => (200, 299),
            StatusBand::Error => (400, 599),
        };
        Self {
            clause: Some("status >= ? AND status <= ?".to_string()),
            args: vec![SelectionArg::Int(low), SelectionArg::Int(high)],
        }
    }

    /// Normalized clause, `None` when every record is selected.
    #[must_use]
    pub fn clause(&self) -> Option<&str> {
        self.clause.as_deref()
    }

    /// Positional arguments in placeholder order.
    #[must_use]
    pub fn args(&self) -> &[SelectionArg] {
        &self.args
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    LParen,
    RParen,
    Placeholder,
    Op(&'static str),
    Int(i64),
    Text(String),
    Column(&'static str),
    And,
    Or,
    Is,
    Not,
    Null,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn tokenize(input: &str) -> Result<Vec<Token>, StoreError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        let kind = match c {
            b'(' => {
                i += 1;
                TokenKind::LParen
            }
            b')' => {
                i += 1;
                TokenKind::RParen
            }
            b'?' => {
                i += 1;
                TokenKind::Placeholder
            }
            b'=' => {
                i += 1;
                TokenKind::Op("=")
            }
            b'!' if bytes.get(i + 1) == Some(&b'=') => {
                i += 2;
                TokenKind::Op("!=")
            }
            b'<' => match bytes.get(i + 1) {
                Some(b'=') => {
                    i += 2;
                    TokenKind::Op("<=")
                }
                Some(b'>') => {
                    i += 2;
                    TokenKind::Op("<>")
                }
                _ => {
                    i += 1;
                    TokenKind::Op("<")
                }
            },
            b'>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    i += 2;
                    TokenKind::Op(">=")
                } else {
                    i += 1;
                    TokenKind::Op(">")
                }
            }
            b'\'' => {
                let (text, next) = read_quoted(input, i)?;
                i = next;
                TokenKind::Text(text)
            }
            b'-' | b'0'..=b'9' => {
                let mut end = i + 1;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let literal = &input[i..end];
                let value = literal
                    .parse::<i64>()
                    .map_err(|_| StoreError::invalid_selection(start, "invalid integer literal"))?;
                i = end;
                TokenKind::Int(value)
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let mut end = i + 1;
                while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                let word = input[i..end].to_ascii_lowercase();
                i = end;
                match word.as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "is" => TokenKind::Is,
                    "not" => TokenKind::Not,
                    "null" => TokenKind::Null,
                    other => match ALLOWED_COLUMNS.iter().find(|col| **col == other) {
                        Some(col) => TokenKind::Column(col),
                        None => {
                            return Err(StoreError::invalid_selection(
                                start,
                                format!("unknown column '{other}'"),
                            ));
                        }
                    },
                }
            }
            _ => {
                return Err(StoreError::invalid_selection(
                    start,
                    format!("unexpected character '{}'", char::from(c)),
                ));
            }
        };

        tokens.push(Token {
            kind,
            offset: start,
        });
    }

    Ok(tokens)
}

/// Reads a single-quoted literal starting at `start`; `''` escapes a quote.
fn read_quoted(input: &str, start: usize) -> Result<(String, usize), StoreError> {
    let bytes = input.as_bytes();
    let mut i = start + 1;
    let mut text = String::new();
    let mut segment_start = i;

    while i < bytes.len() {
        if bytes[i] == b'\'' {
            text.push_str(&input[segment_start..i]);
            if bytes.get(i + 1) == Some(&b'\'') {
                text.push('\'');
                i += 2;
                segment_start = i;
                continue;
            }
            return Ok((text, i + 1));
        }
        i += 1;
    }

    Err(StoreError::invalid_selection(
        start,
        "unterminated string literal",
    ))
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    placeholders: usize,
    depth: usize,
    end_offset: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Result<&Token, StoreError> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| StoreError::invalid_selection(self.end_offset, "unexpected end"))?;
        self.pos += 1;
        Ok(token)
    }

    fn expr(&mut self) -> Result<(), StoreError> {
        self.and_expr()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Or)) {
            self.pos += 1;
            self.and_expr()?;
        }
        Ok(())
    }

    fn and_expr(&mut self) -> Result<(), StoreError> {
        self.term()?;
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::And)) {
            self.pos += 1;
            self.term()?;
        }
        Ok(())
    }

    fn term(&mut self) -> Result<(), StoreError> {
        let token = self.next()?.clone();
        match token.kind {
            TokenKind::LParen => {
                if self.depth == MAX_NESTING {
                    return Err(StoreError::invalid_selection(
                        token.offset,
                        "nesting too deep",
                    ));
                }
                self.depth += 1;
                self.expr()?;
                self.depth -= 1;
                let close = self.next()?.clone();
                if close.kind != TokenKind::RParen {
                    return Err(StoreError::invalid_selection(close.offset, "expected ')'"));
                }
                Ok(())
            }
            TokenKind::Column(_) => self.comparison(),
            _ => Err(StoreError::invalid_selection(
                token.offset,
                "expected column or '('",
            )),
        }
    }

    fn comparison(&mut self) -> Result<(), StoreError> {
        let op = self.next()?.clone();
        match op.kind {
            TokenKind::Op(_) => {
                let operand = self.next()?.clone();
                match operand.kind {
                    TokenKind::Placeholder => {
                        self.placeholders += 1;
                        Ok(())
                    }
                    TokenKind::Int(_) | TokenKind::Text(_) => Ok(()),
                    _ => Err(StoreError::invalid_selection(
                        operand.offset,
                        "expected '?', integer or quoted text",
                    )),
                }
            }
            TokenKind::Is => {
                let mut next = self.next()?.clone();
                if next.kind == TokenKind::Not {
                    next = self.next()?.clone();
                }
                if next.kind == TokenKind::Null {
                    Ok(())
                } else {
                    Err(StoreError::invalid_selection(next.offset, "expected NULL"))
                }
            }
            _ => Err(StoreError::invalid_selection(
                op.offset,
                "expected comparison operator or IS",
            )),
        }
    }
}

/// Re-emits validated tokens as SQL with canonical spacing.
fn render(tokens: &[Token]) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(tokens.len());
    for token in tokens {
        let part = match &token.kind {
            TokenKind::LParen => "(".to_string(),
            TokenKind::RParen => ")".to_string(),
            TokenKind::Placeholder => "?".to_string(),
            TokenKind::Op(op) => (*op).to_string(),
            TokenKind::Int(value) => value.to_string(),
            TokenKind::Text(text) => format!("'{}'", text.replace('\'', "''")),
            TokenKind::Column(col) => (*col).to_string(),
            TokenKind::And => "AND".to_string(),
            TokenKind::Or => "OR".to_string(),
            TokenKind::Is => "IS".to_string(),
            TokenKind::Not => "NOT".to_string(),
            TokenKind::Null => "NULL".to_string(),
        };
        parts.push(part);
    }
    parts.join(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_comparison() {
        let sel = Selection::parse("status = ?", vec![SelectionArg::Int(200)]).unwrap();
        assert_eq!(sel.clause(), Some("status = ?"));
        assert_eq!(sel.args(), &[SelectionArg::Int(200)]);
    }

    #[test]
    fn test_parse_nested_boolean_expression() {
        let sel = Selection::parse(
            "(status >= 400 AND status <= 599) or local_path is not null",
            vec![],
        )
        .unwrap();
        assert_eq!(
            sel.clause(),
            Some("( status >= 400 AND status <= 599 ) OR local_path IS NOT NULL")
        );
    }

    #[test]
    fn test_parse_quoted_literal_with_escape() {
        let sel = Selection::parse("hint = 'it''s.pdf'", vec![]).unwrap();
        assert_eq!(sel.clause(), Some("hint = 'it''s.pdf'"));
    }

    #[test]
    fn test_empty_clause_selects_all() {
        let sel = Selection::parse("   ", vec![]).unwrap();
        assert!(sel.clause().is_none());
    }

    #[test]
    fn test_rejects_unknown_column() {
        let err = Selection::parse("password = ?", vec!["x".into()]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidSelection { offset: 0, .. }));
    }

    #[test]
    fn test_rejects_statement_separator() {
        let err = Selection::parse("id = 1; DROP TABLE downloads", vec![]).unwrap_err();
        assert!(matches!(err, StoreError::InvalidSelection { offset: 6, .. }));
    }

    #[test]
    fn test_rejects_comment_and_functions() {
        assert!(Selection::parse("id = 1 -- x", vec![]).is_err());
        assert!(Selection::parse("lower(hint) = 'a'", vec![]).is_err());
        assert!(Selection::parse("hint LIKE 'a%'", vec![]).is_err());
    }

    #[test]
    fn test_rejects_dangling_operator() {
        assert!(Selection::parse("status =", vec![]).is_err());
        assert!(Selection::parse("status = 1 AND", vec![]).is_err());
        assert!(Selection::parse("(status = 1", vec![]).is_err());
        assert!(Selection::parse("status = 1)", vec![]).is_err());
    }

    #[test]
    fn test_rejects_unterminated_string() {
        let err = Selection::parse("hint = 'abc", vec![]).unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn test_argument_count_mismatch() {
        let err = Selection::parse("id = ? OR id = ?", vec![SelectionArg::Int(1)]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::ArgumentCount {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_negative_integer_literal() {
        let sel = Selection::parse("total_bytes = -1", vec![]).unwrap();
        assert_eq!(sel.clause(), Some("total_bytes = -1"));
    }

    #[test]
    fn test_rejects_deep_nesting_without_recursing() {
        let clause = format!("{}id = 1{}", "(".repeat(200_000), ")".repeat(200_000));
        let err = Selection::parse(&clause, vec![]).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidSelection { offset: 64, .. }
        ));
        assert!(err.to_string().contains("nesting too deep"));
    }

    #[test]
    fn test_nesting_at_limit_is_accepted() {
        let clause = format!("{}id = 1{}", "(".repeat(64), ")".repeat(64));
        let sel = Selection::parse(&clause, vec![]).unwrap();
        assert!(sel.clause().is_some());
    }

    #[test]
    fn test_status_band_selection() {
        let sel = Selection::status_band(StatusBand::Running);
        assert_eq!(sel.args(), &[SelectionArg::Int(191), SelectionArg::Int(199)]);
    }
}
