//! Static token-kind to display-style mapping, plus terminal highlighting.

use colored::{ColoredString, Colorize};
use serde::Serialize;

use crate::lexer::{Lexer, TokenKind};
use crate::registry::EntityRegistry;

/// Foreground colour and font flags for one token kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Style {
    /// `#RRGGBB`.
    pub foreground: &'static str,
    pub italic: bool,
    pub underline: bool,
}

impl Style {
    const fn plain(foreground: &'static str) -> Self {
        Self {
            foreground,
            italic: false,
            underline: false,
        }
    }

    /// Foreground as an RGB triple.
    pub fn rgb(&self) -> (u8, u8, u8) {
        let hex = self.foreground.trim_start_matches('#');
        let channel = |i: usize| {
            hex.get(i..i + 2)
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .unwrap_or(0xD4)
        };
        (channel(0), channel(2), channel(4))
    }

    fn paint(&self, text: &str) -> ColoredString {
        let (r, g, b) = self.rgb();
        let mut painted = text.truecolor(r, g, b);
        if self.italic {
            painted = painted.italic();
        }
        if self.underline {
            painted = painted.underline();
        }
        painted
    }
}

pub fn style_for(kind: TokenKind) -> Style {
    match kind {
        TokenKind::Comment => Style {
            foreground: "#6A9955",
            italic: true,
            underline: false,
        },
        TokenKind::Method => Style::plain("#DCDCAA"),
        TokenKind::KeywordControl => Style::plain("#C586C0"),
        TokenKind::EntityName => Style::plain("#4EC9B0"),
        TokenKind::String => Style::plain("#CE9178"),
        TokenKind::NumberFloat | TokenKind::NumberHex | TokenKind::NumberInt => {
            Style::plain("#B5CEA8")
        }
        TokenKind::Identifier => Style::plain("#9CDCFE"),
        TokenKind::Operator | TokenKind::Punctuation => Style::plain("#D4D4D4"),
        TokenKind::Invalid => Style {
            foreground: "#F44747",
            italic: false,
            underline: true,
        },
    }
}

/// Render `source` with ANSI true-colour escapes. Text between tokens is
/// copied unchanged, so the output reads exactly like the input.
pub fn highlight(source: &str, registry: Option<&EntityRegistry>) -> String {
    let lexer = match registry {
        Some(registry) => Lexer::with_registry(source, registry),
        None => Lexer::new(source),
    };

    let mut out = String::with_capacity(source.len() * 2);
    let mut last = 0;
    for token in lexer {
        out.push_str(&source[last..token.span.start]);
        out.push_str(&style_for(token.kind).paint(token.text).to_string());
        last = token.span.end;
    }
    out.push_str(&source[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_palette() {
        assert_eq!(style_for(TokenKind::Comment).rgb(), (0x6A, 0x99, 0x55));
        assert!(style_for(TokenKind::Comment).italic);
        assert_eq!(style_for(TokenKind::NumberHex), style_for(TokenKind::NumberInt));
        assert!(style_for(TokenKind::Invalid).underline);
    }

    #[test]
    fn test_highlight_preserves_text() {
        colored::control::set_override(false);
        let source = "user.findMany({ take: 2 }) // two";
        assert_eq!(highlight(source, None), source);
    }
}
