//! Query tokenizer.
//!
//! Splits query text into classified tokens for highlighting, and doubles as a
//! first lint pass: unterminated strings, template literals and unknown
//! characters come out as [`TokenKind::Invalid`] tokens carrying a
//! [`Diagnostic`]. Tokenizing never fails and has no side effects.
//!
//! | text        | kind              |
//! |-------------|-------------------|
//! | `user`      | entity / identifier |
//! | `findMany`  | method            |
//! | `where`     | keyword.control   |
//! | `"bob"`     | string            |
//! | `0x1F`      | number.hex        |
//! | `:` `>=`    | operator          |
//! | `{` `)` `,` | delimiter         |

use serde::Serialize;

use crate::registry::{EntityRegistry, Operation, QueryOption};

/// Classification of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenKind {
    Comment,
    Method,
    KeywordControl,
    EntityName,
    String,
    NumberFloat,
    NumberHex,
    NumberInt,
    Identifier,
    Operator,
    Punctuation,
    Invalid,
}

impl TokenKind {
    /// Dotted style name understood by editor themes.
    pub fn style_name(&self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::Method => "method",
            Self::KeywordControl => "keyword.control",
            Self::EntityName => "type",
            Self::String => "string",
            Self::NumberFloat => "number.float",
            Self::NumberHex => "number.hex",
            Self::NumberInt => "number",
            Self::Identifier => "identifier",
            Self::Operator => "operator",
            Self::Punctuation => "delimiter",
            Self::Invalid => "invalid",
        }
    }
}

/// Byte range `[start, end)` in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub span: Span,
    pub text: &'a str,
}

impl<'a> Token<'a> {
    /// Lint diagnostic for invalid tokens.
    pub fn diagnostic(&self) -> Option<Diagnostic> {
        if self.kind != TokenKind::Invalid {
            return None;
        }
        let message = match self.text.chars().next() {
            Some('"') | Some('\'') => "unterminated string literal".to_string(),
            Some('`') => "template literals are not supported; use a quoted string".to_string(),
            Some(c) => format!("unrecognized character '{}'", c),
            None => "unexpected input".to_string(),
        };
        Some(Diagnostic {
            span: self.span,
            message,
        })
    }
}

/// Lint-level finding with the offending span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub span: Span,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}: {}", self.span.start, self.span.end, self.message)
    }
}

const MULTI_CHAR_OPERATORS: [&str; 8] = ["==", "<=", ">=", "!=", "&&", "||", "++", "--"];
const OPERATOR_CHARS: &str = "=><!~?:+-*/&|^%";
const PUNCTUATION_CHARS: &str = "(){}[],.;";

/// Lazy, restartable token stream over a query string.
#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    source: &'a str,
    pos: usize,
    registry: Option<&'a EntityRegistry>,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            pos: 0,
            registry: None,
        }
    }

    /// Classify registered entity names as [`TokenKind::EntityName`].
    pub fn with_registry(source: &'a str, registry: &'a EntityRegistry) -> Self {
        Self {
            source,
            pos: 0,
            registry: Some(registry),
        }
    }

    /// Rewind to the start of the source.
    pub fn restart(&mut self) {
        self.pos = 0;
    }

    pub fn source(&self) -> &'a str {
        self.source
    }

    fn rest(&self) -> &'a str {
        &self.source[self.pos..]
    }

    fn token(&mut self, kind: TokenKind, len: usize) -> Token<'a> {
        let start = self.pos;
        self.pos += len;
        Token {
            kind,
            span: Span::new(start, self.pos),
            text: &self.source[start..self.pos],
        }
    }

    fn classify_word(&self, word: &str) -> TokenKind {
        if Operation::from_name(word).is_some() {
            TokenKind::Method
        } else if QueryOption::from_name(word).is_some() {
            TokenKind::KeywordControl
        } else if self.registry.is_some_and(|r| r.contains(word)) {
            TokenKind::EntityName
        } else {
            TokenKind::Identifier
        }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        let trimmed = self.rest().trim_start();
        self.pos = self.source.len() - trimmed.len();

        let rest = self.rest();
        let first = rest.chars().next()?;

        // Comments
        if rest.starts_with("//") {
            let len = rest.find('\n').unwrap_or(rest.len());
            return Some(self.token(TokenKind::Comment, len));
        }

        // Identifiers and keywords
        if is_ident_start(first) {
            let len = ident_len(rest);
            let kind = self.classify_word(&rest[..len]);
            return Some(self.token(kind, len));
        }

        // Strings
        if first == '"' || first == '\'' {
            return Some(match string_len(rest, first) {
                Some(len) => self.token(TokenKind::String, len),
                None => {
                    let len = rest.find('\n').unwrap_or(rest.len());
                    self.token(TokenKind::Invalid, len)
                }
            });
        }
        if first == '`' {
            let len = rest[1..].find('`').map(|i| i + 2).unwrap_or(rest.len());
            return Some(self.token(TokenKind::Invalid, len));
        }

        // Numbers
        if first.is_ascii_digit() || (first == '.' && rest[1..].starts_with(|c: char| c.is_ascii_digit())) {
            let (kind, len) = number_len(rest);
            return Some(self.token(kind, len));
        }

        // Operators
        if let Some(op) = MULTI_CHAR_OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            return Some(self.token(TokenKind::Operator, op.len()));
        }
        if OPERATOR_CHARS.contains(first) {
            return Some(self.token(TokenKind::Operator, 1));
        }
        if PUNCTUATION_CHARS.contains(first) {
            return Some(self.token(TokenKind::Punctuation, 1));
        }

        Some(self.token(TokenKind::Invalid, first.len_utf8()))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

fn ident_len(input: &str) -> usize {
    input.find(|c: char| !is_ident_char(c)).unwrap_or(input.len())
}

/// Length of a quoted string including both quotes, or `None` if the line
/// ends before the closing quote.
fn string_len(input: &str, quote: char) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in input.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\n' => return None,
            '\\' => escaped = true,
            c if c == quote => return Some(i + c.len_utf8()),
            _ => {}
        }
    }
    None
}

fn number_len(input: &str) -> (TokenKind, usize) {
    let bytes = input.as_bytes();
    let digits = |from: usize| {
        bytes[from..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    // 0x1F
    if bytes.len() > 2 && bytes[0] == b'0' && (bytes[1] == b'x' || bytes[1] == b'X') {
        let hex = bytes[2..].iter().take_while(|b| b.is_ascii_hexdigit()).count();
        if hex > 0 {
            return (TokenKind::NumberHex, 2 + hex);
        }
    }

    // \d*\.\d+([eE][-+]?\d+)?
    let int = digits(0);
    if bytes.get(int) == Some(&b'.') {
        let frac = digits(int + 1);
        if frac > 0 {
            let mut len = int + 1 + frac;
            if matches!(bytes.get(len), Some(b'e') | Some(b'E')) {
                let sign = usize::from(matches!(bytes.get(len + 1), Some(b'+') | Some(b'-')));
                let exp = digits(len + 1 + sign);
                if exp > 0 {
                    len += 1 + sign + exp;
                }
            }
            return (TokenKind::NumberFloat, len);
        }
    }

    (TokenKind::NumberInt, int)
}

/// Tokenize `source` eagerly.
pub fn tokenize(source: &str) -> Vec<Token<'_>> {
    Lexer::new(source).collect()
}

/// Lint diagnostics for `source`.
pub fn lint(source: &str) -> Vec<Diagnostic> {
    Lexer::new(source).filter_map(|t| t.diagnostic()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{EntitySchema, SchemaDescription};
    use pretty_assertions::assert_eq;

    fn kinds(source: &str) -> Vec<(TokenKind, &str)> {
        Lexer::new(source).map(|t| (t.kind, t.text)).collect()
    }

    #[test]
    fn test_simple_query() {
        assert_eq!(
            kinds("user.findMany({ where: { active: true } })"),
            vec![
                (TokenKind::Identifier, "user"),
                (TokenKind::Punctuation, "."),
                (TokenKind::Method, "findMany"),
                (TokenKind::Punctuation, "("),
                (TokenKind::Punctuation, "{"),
                (TokenKind::KeywordControl, "where"),
                (TokenKind::Operator, ":"),
                (TokenKind::Punctuation, "{"),
                (TokenKind::Identifier, "active"),
                (TokenKind::Operator, ":"),
                (TokenKind::Identifier, "true"),
                (TokenKind::Punctuation, "}"),
                (TokenKind::Punctuation, "}"),
                (TokenKind::Punctuation, ")"),
            ]
        );
    }

    #[test]
    fn test_entity_names_from_registry() {
        let registry = EntityRegistry::from_schema(&SchemaDescription::new(vec![
            EntitySchema::new("User"),
        ]))
        .unwrap();
        let tokens: Vec<_> = Lexer::with_registry("user.count()", &registry).collect();
        assert_eq!(tokens[0].kind, TokenKind::EntityName);
        assert_eq!(tokens[2].kind, TokenKind::Method);
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("42 3.14 .5 1.5e10 0xFF 0x"),
            vec![
                (TokenKind::NumberInt, "42"),
                (TokenKind::NumberFloat, "3.14"),
                (TokenKind::NumberFloat, ".5"),
                (TokenKind::NumberFloat, "1.5e10"),
                (TokenKind::NumberHex, "0xFF"),
                (TokenKind::NumberInt, "0"),
                (TokenKind::Identifier, "x"),
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            kinds(r#""a \"b\"" 'c'"#),
            vec![
                (TokenKind::String, r#""a \"b\"""#),
                (TokenKind::String, "'c'"),
            ]
        );
    }

    #[test]
    fn test_comments_and_operators() {
        assert_eq!(
            kinds("// find users\na >= b"),
            vec![
                (TokenKind::Comment, "// find users"),
                (TokenKind::Identifier, "a"),
                (TokenKind::Operator, ">="),
                (TokenKind::Identifier, "b"),
            ]
        );
    }

    #[test]
    fn test_unterminated_string_diagnostic() {
        let source = r#"user.findMany({ where: { name: "bob } })"#;
        let diagnostics = lint(source);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].message, "unterminated string literal");
        assert_eq!(diagnostics[0].span.start, source.find('"').unwrap());
        assert_eq!(diagnostics[0].span.end, source.len());
    }

    #[test]
    fn test_escaped_line_continuation() {
        let source = "user.findMany({ where: { name: 'a\\\nb' } })";
        assert!(lint(source).is_empty());
        let strings: Vec<_> = tokenize(source)
            .into_iter()
            .filter(|t| t.kind == TokenKind::String)
            .collect();
        assert_eq!(strings.len(), 1);
        assert_eq!(strings[0].text, "'a\\\nb'");
    }

    #[test]
    fn test_unrecognized_character() {
        let diagnostics = lint("user.findMany(#)");
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].span, Span::new(14, 15));
        assert_eq!(diagnostics[0].message, "unrecognized character '#'");
    }

    #[test]
    fn test_template_literal_is_invalid() {
        let tokens = tokenize("`${x}`");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Invalid);
    }

    #[test]
    fn test_restartable_and_deterministic() {
        let mut lexer = Lexer::new("post.count({ take: 5 })");
        let first: Vec<_> = lexer.by_ref().collect();
        assert!(lexer.next().is_none());
        lexer.restart();
        let second: Vec<_> = lexer.clone().collect();
        assert_eq!(first, second);
        assert_eq!(first, tokenize("post.count({ take: 5 })"));
    }

    #[test]
    fn test_non_ascii_is_char_aligned() {
        let tokens = tokenize("é");
        assert_eq!(tokens[0].kind, TokenKind::Invalid);
        assert_eq!(tokens[0].span, Span::new(0, 2));
        let tokens = tokenize("'héllo'");
        assert_eq!(tokens[0].kind, TokenKind::String);
    }
}
