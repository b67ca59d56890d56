//! Call-expression parser.
//!
//! Recognizes the one shape a query may take:
//!
//! ```text
//! user.findMany({ where: { active: true } })
//! ─┬── ───┬──── ──────────────┬───────────
//!  │      │                   └── argument object (data literal only)
//!  │      └── operation
//!  └── entity
//! ```
//!
//! Parsing is staged so the resolver can check the entity before looking at
//! the operation, and both before any argument text is read.

pub mod literal;


use crate::error::{QuarryError, QuarryResult};
use literal::{identifier, ws, Entry, LiteralError, LiteralParser};

/// A name in the source together with its byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Located<'a> {
    pub text: &'a str,
    pub position: usize,
}

/// Stateless cursor helper over one query string.
#[derive(Debug, Clone, Copy)]
pub struct CallParser<'a> {
    source: &'a str,
}

impl<'a> CallParser<'a> {
    pub fn new(source: &'a str) -> Self {
        Self { source }
    }

    /// Byte offset of `rest` within the source.
    pub fn offset(&self, rest: &str) -> usize {
        self.source.len() - rest.len()
    }

    fn skip_ws(&self, input: &'a str) -> &'a str {
        match ws(input) {
            Ok((rest, _)) => rest,
            Err(_) => input,
        }
    }

    /// Leading entity name.
    pub fn entity(&self) -> QuarryResult<(&'a str, Located<'a>)> {
        let input = self.skip_ws(self.source);
        match identifier(input) {
            Ok((rest, name)) => Ok((
                rest,
                Located {
                    text: name,
                    position: self.offset(input),
                },
            )),
            Err(_) => Err(QuarryError::invalid(
                self.offset(input),
                "expected an entity name, as in 'user.findMany({})'",
            )),
        }
    }

    /// `.operation` after the entity.
    pub fn operation(&self, input: &'a str) -> QuarryResult<(&'a str, Located<'a>)> {
        let input = self.skip_ws(input);
        let Some(input) = input.strip_prefix('.') else {
            return Err(QuarryError::invalid(
                self.offset(input),
                "expected '.' followed by an operation name",
            ));
        };
        let input = self.skip_ws(input);
        match identifier(input) {
            Ok((rest, name)) => Ok((
                rest,
                Located {
                    text: name,
                    position: self.offset(input),
                },
            )),
            Err(_) => Err(QuarryError::invalid(
                self.offset(input),
                "expected an operation name after '.'",
            )),
        }
    }

    /// `( {...}? )`, returning the top-level entries of the argument object.
    pub fn arguments(
        &self,
        input: &'a str,
        literals: LiteralParser,
    ) -> QuarryResult<(&'a str, Vec<Entry<'a>>)> {
        let input = self.skip_ws(input);
        let Some(input) = input.strip_prefix('(') else {
            return Err(QuarryError::invalid(
                self.offset(input),
                "expected '(' after the operation name",
            ));
        };

        let input = self.skip_ws(input);
        let (rest, entries) = match input.chars().next() {
            Some(')') => (input, Vec::new()),
            Some('{') => literals
                .entries(input, 1)
                .map_err(|e| self.literal_error(e))?,
            Some(_) => {
                // Surface the literal grammar's own complaint when there is one.
                literals
                    .value(input, 1)
                    .map_err(|e| self.literal_error(e))?;
                return Err(QuarryError::malformed(
                    self.offset(input),
                    "arguments must be a single object literal",
                ));
            }
            None => {
                return Err(QuarryError::malformed(
                    self.offset(input),
                    "unexpected end of input, expected ')'",
                ));
            }
        };

        let rest = self.skip_ws(rest);
        match rest.chars().next() {
            Some(')') => Ok((&rest[1..], entries)),
            Some(',') => Err(QuarryError::malformed(
                self.offset(rest),
                "only one argument object is allowed",
            )),
            Some(c) => Err(QuarryError::malformed(
                self.offset(rest),
                format!("expected ')' but found '{}'", c),
            )),
            None => Err(QuarryError::malformed(
                self.offset(rest),
                "unexpected end of input, expected ')'",
            )),
        }
    }

    /// Nothing but whitespace, comments and one `;` may follow the call.
    pub fn finish(&self, input: &'a str) -> QuarryResult<()> {
        let input = self.skip_ws(input);
        let input = match input.strip_prefix(';') {
            Some(rest) => self.skip_ws(rest),
            None => input,
        };

        if input.is_empty() {
            return Ok(());
        }
        if input.starts_with('.') {
            return Err(QuarryError::invalid(
                self.offset(input),
                "chained calls are not supported; submit one call per query",
            ));
        }
        Err(QuarryError::invalid(
            self.offset(input),
            format!("unexpected trailing content: '{}'", input),
        ))
    }

    fn literal_error(&self, err: nom::Err<LiteralError<'a>>) -> QuarryError {
        match err {
            nom::Err::Error(e) | nom::Err::Failure(e) => {
                QuarryError::malformed(self.offset(e.input), e.message())
            }
            nom::Err::Incomplete(_) => {
                QuarryError::malformed(self.source.len(), "unexpected end of input")
            }
        }
    }
}
