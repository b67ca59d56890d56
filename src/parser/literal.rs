//! Data-literal grammar for argument objects.
//!
//! Accepts objects, arrays, quoted strings, numbers, `true`, `false` and
//! `null`, in the relaxed object-literal syntax people type by hand (unquoted
//! keys, single quotes, trailing commas, `//` comments). Anything that would
//! need evaluation is a hard failure: identifiers, calls, member access,
//! spreads, template literals.
//!
//! Every failure is raised as `nom::Err::Failure` at the exact input where it
//! was detected, so the reported offset points at the offending character.

use std::borrow::Cow;

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while},
    character::complete::{
        char, digit0, digit1, hex_digit1, multispace1, not_line_ending, one_of, satisfy,
    },
    combinator::{opt, recognize, value},
    error::{ErrorKind, ParseError},
    multi::many0,
    sequence::{pair, tuple},
    IResult,
};
use serde_json::{Map, Number, Value};

/// Parse error carrying the remaining input at the failure point.
#[derive(Debug, Clone, PartialEq)]
pub struct LiteralError<'a> {
    pub input: &'a str,
    pub message: Option<Cow<'static, str>>,
}

impl<'a> LiteralError<'a> {
    pub fn new(input: &'a str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            input,
            message: Some(message.into()),
        }
    }

    pub fn message(&self) -> Cow<'static, str> {
        self.message.clone().unwrap_or(Cow::Borrowed("invalid literal"))
    }
}

impl<'a> ParseError<&'a str> for LiteralError<'a> {
    fn from_error_kind(input: &'a str, _kind: ErrorKind) -> Self {
        Self {
            input,
            message: None,
        }
    }

    fn append(_input: &'a str, _kind: ErrorKind, other: Self) -> Self {
        other
    }

    fn from_char(input: &'a str, c: char) -> Self {
        Self::new(input, format!("expected '{}'", c))
    }

    // Keep whichever branch got further into the input.
    fn or(self, other: Self) -> Self {
        match self.input.len().cmp(&other.input.len()) {
            std::cmp::Ordering::Less => self,
            std::cmp::Ordering::Greater => other,
            std::cmp::Ordering::Equal if self.message.is_some() => self,
            std::cmp::Ordering::Equal => other,
        }
    }
}

pub type LitResult<'a, T> = IResult<&'a str, T, LiteralError<'a>>;

fn fail<'a, T>(input: &'a str, message: impl Into<Cow<'static, str>>) -> LitResult<'a, T> {
    Err(nom::Err::Failure(LiteralError::new(input, message)))
}

/// Skip whitespace and `//` comments.
pub fn ws(input: &str) -> LitResult<'_, ()> {
    value(
        (),
        many0(alt((
            value((), multispace1),
            value((), pair(tag("//"), not_line_ending)),
        ))),
    )(input)
}

/// One top-level `key: value` pair, with the input at the key for offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<'a> {
    pub key: String,
    pub at: &'a str,
    pub value: Value,
}

/// Literal parser with a nesting limit.
#[derive(Debug, Clone, Copy)]
pub struct LiteralParser {
    max_depth: usize,
}

impl LiteralParser {
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth: max_depth.max(1),
        }
    }

    /// Parse `{ ... }` into its entries, in source order. `depth` is the
    /// nesting level of this object (the argument object is level 1).
    pub fn entries<'a>(&self, input: &'a str, depth: usize) -> LitResult<'a, Vec<Entry<'a>>> {
        let (mut input, _) = char('{')(input)?;
        if depth > self.max_depth {
            return fail(
                input,
                format!("arguments nest deeper than the limit of {}", self.max_depth),
            );
        }

        let mut entries = Vec::new();
        loop {
            let (rest, _) = ws(input)?;
            if let Some(rest) = rest.strip_prefix('}') {
                return Ok((rest, entries));
            }

            let at = rest;
            let (rest, key) = self.key(rest)?;
            let (rest, _) = ws(rest)?;
            let rest = match rest.chars().next() {
                Some(':') => &rest[1..],
                Some(',') | Some('}') => {
                    return fail(
                        at,
                        format!(
                            "shorthand property '{}' refers to a variable; write '{}: <value>'",
                            key, key
                        ),
                    );
                }
                Some('(') => return fail(at, "methods are not allowed in arguments"),
                _ => return fail(rest, format!("expected ':' after key '{}'", key)),
            };
            let (rest, value) = self.value(rest, depth + 1)?;
            entries.push(Entry { key, at, value });

            let (rest, _) = ws(rest)?;
            match rest.chars().next() {
                Some(',') => input = &rest[1..],
                Some('}') => return Ok((&rest[1..], entries)),
                Some(c) => return fail(rest, format!("expected ',' or '}}' but found '{}'", c)),
                None => return fail(rest, "unexpected end of input, expected ',' or '}'"),
            }
        }
    }

    fn key<'a>(&self, input: &'a str) -> LitResult<'a, String> {
        match input.chars().next() {
            Some(q @ ('"' | '\'')) => string(input, q),
            Some(c) if is_ident_start(c) => {
                let (rest, name) = identifier(input)?;
                Ok((rest, name.to_string()))
            }
            Some(c) if c.is_ascii_digit() => {
                let (rest, text) = number_text(input)?;
                Ok((rest, text.to_string()))
            }
            Some('.') if input.starts_with("...") => fail(input, "spread syntax is not allowed"),
            Some('[') => fail(input, "computed keys are not allowed"),
            Some(c) => fail(input, format!("expected a key but found '{}'", c)),
            None => fail(input, "unexpected end of input, expected a key"),
        }
    }

    /// Parse any literal value, skipping leading whitespace.
    pub fn value<'a>(&self, input: &'a str, depth: usize) -> LitResult<'a, Value> {
        let (input, _) = ws(input)?;
        match input.chars().next() {
            Some('{') => {
                let (rest, entries) = self.entries(input, depth)?;
                Ok((rest, Value::Object(into_map(entries))))
            }
            Some('[') => self.array(input, depth),
            Some(q @ ('"' | '\'')) => {
                let (rest, s) = string(input, q)?;
                Ok((rest, Value::String(s)))
            }
            Some('`') => fail(input, "template literals are not allowed, use a quoted string"),
            Some('/') => fail(input, "regular expressions are not allowed"),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '.' => number(input),
            Some(c) if is_ident_start(c) => self.word(input),
            Some(c) => fail(input, format!("unexpected character '{}'", c)),
            None => fail(input, "unexpected end of input, expected a value"),
        }
    }

    fn array<'a>(&self, input: &'a str, depth: usize) -> LitResult<'a, Value> {
        let (mut input, _) = char('[')(input)?;
        if depth > self.max_depth {
            return fail(
                input,
                format!("arguments nest deeper than the limit of {}", self.max_depth),
            );
        }

        let mut items = Vec::new();
        loop {
            let (rest, _) = ws(input)?;
            if let Some(rest) = rest.strip_prefix(']') {
                return Ok((rest, Value::Array(items)));
            }
            if rest.starts_with("...") {
                return fail(rest, "spread syntax is not allowed");
            }
            let (rest, item) = self.value(rest, depth + 1)?;
            items.push(item);

            let (rest, _) = ws(rest)?;
            match rest.chars().next() {
                Some(',') => input = &rest[1..],
                Some(']') => return Ok((&rest[1..], Value::Array(items))),
                Some(c) => return fail(rest, format!("expected ',' or ']' but found '{}'", c)),
                None => return fail(rest, "unexpected end of input, expected ',' or ']'"),
            }
        }
    }

    /// `true`, `false`, `null`; every other word would be a reference.
    fn word<'a>(&self, input: &'a str) -> LitResult<'a, Value> {
        let (rest, name) = identifier(input)?;
        match name {
            "true" => return Ok((rest, Value::Bool(true))),
            "false" => return Ok((rest, Value::Bool(false))),
            "null" => return Ok((rest, Value::Null)),
            "new" => return fail(input, "constructor expressions are not allowed"),
            _ => {}
        }

        let (after, _) = ws(rest)?;
        match after.chars().next() {
            Some('(') => fail(input, format!("function calls are not allowed ('{}(...)')", name)),
            Some('.') | Some('[') => fail(input, "member access expressions are not allowed"),
            _ => fail(
                input,
                format!(
                    "'{}' is not a literal value; quote strings and use true, false or null",
                    name
                ),
            ),
        }
    }
}

fn into_map(entries: Vec<Entry<'_>>) -> Map<String, Value> {
    let mut map = Map::new();
    for entry in entries {
        map.insert(entry.key, entry.value);
    }
    map
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// `[A-Za-z_$][A-Za-z0-9_$]*`
pub fn identifier(input: &str) -> LitResult<'_, &str> {
    recognize(pair(satisfy(is_ident_start), take_while(is_ident_char)))(input)
}

/// Whether all of `name` is one identifier.
pub fn is_identifier(name: &str) -> bool {
    matches!(identifier(name), Ok(("", _)))
}

/// Quoted string with JS escapes. `input` starts at the opening quote.
fn string(input: &str, quote: char) -> LitResult<'_, String> {
    let mut out = String::new();
    let mut chars = input.char_indices().skip(1);

    while let Some((i, c)) = chars.next() {
        match c {
            c if c == quote => return Ok((&input[i + c.len_utf8()..], out)),
            '\n' => return fail(&input[i..], "unterminated string literal"),
            '\\' => {
                let Some((j, esc)) = chars.next() else {
                    break;
                };
                match esc {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    'b' => out.push('\u{8}'),
                    'f' => out.push('\u{c}'),
                    'v' => out.push('\u{b}'),
                    '0' => out.push('\0'),
                    '\n' => {}
                    'u' => {
                        let (len, ch) = unicode_escape(&input[j + 1..])
                            .ok_or_else(|| {
                                nom::Err::Failure(LiteralError::new(
                                    &input[i..],
                                    "invalid unicode escape",
                                ))
                            })?;
                        out.push(ch);
                        for _ in 0..len {
                            chars.next();
                        }
                    }
                    other => out.push(other),
                }
            }
            c => out.push(c),
        }
    }

    fail(&input[input.len()..], "unterminated string literal")
}

/// `XXXX` or `{X...}` after `\u`; returns consumed length and the char.
fn unicode_escape(input: &str) -> Option<(usize, char)> {
    if let Some(rest) = input.strip_prefix('{') {
        let end = rest.find('}')?;
        let code = u32::from_str_radix(&rest[..end], 16).ok()?;
        return char::from_u32(code).map(|c| (end + 2, c));
    }
    let code = hex4(input)?;
    if (0xD800..0xDC00).contains(&code) {
        // High surrogate; only valid as the first half of a `\uXXXX\uXXXX` pair.
        let low = hex4(input.get(4..)?.strip_prefix("\\u")?)?;
        if !(0xDC00..0xE000).contains(&low) {
            return None;
        }
        let code = 0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00);
        return char::from_u32(code).map(|c| (10, c));
    }
    char::from_u32(code).map(|c| (4, c))
}

fn hex4(input: &str) -> Option<u32> {
    let hex = input.get(..4)?;
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(hex, 16).ok()
}

/// Raw text of a number: hex, or decimal with optional fraction and exponent.
fn number_text(input: &str) -> LitResult<'_, &str> {
    alt((
        recognize(tuple((opt(char('-')), tag_no_case("0x"), hex_digit1))),
        recognize(tuple((
            opt(char('-')),
            alt((
                recognize(tuple((digit0, char('.'), digit1))),
                recognize(pair(digit1, opt(pair(char('.'), digit0)))),
            )),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
    ))(input)
}

fn number(input: &str) -> LitResult<'_, Value> {
    let (rest, text) = match number_text(input) {
        Ok(ok) => ok,
        Err(_) => return fail(input, "invalid number"),
    };
    if rest.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '$') {
        return fail(rest, format!("invalid number '{}'", text));
    }

    let (negative, digits) = match text.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, text),
    };

    if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        return match i64::from_str_radix(hex, 16) {
            Ok(n) => Ok((rest, Value::Number(Number::from(if negative { -n } else { n })))),
            Err(_) => fail(input, format!("number '{}' is out of range", text)),
        };
    }

    if !text.contains(['.', 'e', 'E']) {
        if let Ok(n) = text.parse::<i64>() {
            return Ok((rest, Value::Number(Number::from(n))));
        }
        if let Ok(n) = text.parse::<u64>() {
            return Ok((rest, Value::Number(Number::from(n))));
        }
    }

    match text.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(n) => Ok((rest, Value::Number(n))),
        None => fail(input, format!("number '{}' is out of range", text)),
    }
}
