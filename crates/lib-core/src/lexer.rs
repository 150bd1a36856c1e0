use std::fmt;

use crate::error::EngineError;

/// Token kinds of the constraint language. Words cover keywords, atoms
/// (`null`, `true`, …), bare numbers, and guid literals; the parser sorts
/// them out by context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Open,
    Close,
    Word,
    String,
    Variable,
    Eq,
    Ne,
    Match,
    Lt,
    Le,
    Gt,
    Ge,
    ArrowRight,
    ArrowLeft,
    Minus,
    Pipe,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token's first character in the request text.
    pub at: usize,
    /// Decoded text: identifier for words/variables, unescaped contents
    /// for strings, empty for punctuation.
    pub text: String,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Open => f.write_str("("),
            TokenKind::Close => f.write_str(")"),
            TokenKind::Word => f.write_str(&self.text),
            TokenKind::String => write!(f, "\"{}\"", self.text),
            TokenKind::Variable => write!(f, "${}", self.text),
            TokenKind::Eq => f.write_str("="),
            TokenKind::Ne => f.write_str("!="),
            TokenKind::Match => f.write_str("~="),
            TokenKind::Lt => f.write_str("<"),
            TokenKind::Le => f.write_str("<="),
            TokenKind::Gt => f.write_str(">"),
            TokenKind::Ge => f.write_str(">="),
            TokenKind::ArrowRight => f.write_str("->"),
            TokenKind::ArrowLeft => f.write_str("<-"),
            TokenKind::Minus => f.write_str("-"),
            TokenKind::Pipe => f.write_str("|"),
        }
    }
}

struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_space(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }
}

fn is_word_start(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn is_word_continue(b: u8) -> bool {
    // `-` continues a word only between alphanumerics, so `estimate-count`
    // lexes whole while `sort=(-value)` still sees a minus.
    is_word_start(b) || b == b'.' || b == b':'
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, EngineError> {
    let mut scanner = Scanner {
        src: src.as_bytes(),
        pos: 0,
    };
    let mut tokens = Vec::new();

    loop {
        scanner.skip_space();
        let at = scanner.pos;
        let Some(b) = scanner.peek() else {
            break;
        };

        let simple = |kind| Token {
            kind,
            at,
            text: String::new(),
        };

        match b {
            b'(' => {
                scanner.bump();
                tokens.push(simple(TokenKind::Open));
            }
            b')' => {
                scanner.bump();
                tokens.push(simple(TokenKind::Close));
            }
            b'|' => {
                scanner.bump();
                tokens.push(simple(TokenKind::Pipe));
            }
            b'=' => {
                scanner.bump();
                tokens.push(simple(TokenKind::Eq));
            }
            b'!' => {
                scanner.bump();
                if scanner.bump() != Some(b'=') {
                    return Err(EngineError::syntax(at, "expected `!=`"));
                }
                tokens.push(simple(TokenKind::Ne));
            }
            b'~' => {
                scanner.bump();
                if scanner.bump() != Some(b'=') {
                    return Err(EngineError::syntax(at, "expected `~=`"));
                }
                tokens.push(simple(TokenKind::Match));
            }
            b'<' => {
                scanner.bump();
                match scanner.peek() {
                    Some(b'=') => {
                        scanner.bump();
                        tokens.push(simple(TokenKind::Le));
                    }
                    Some(b'-') => {
                        scanner.bump();
                        tokens.push(simple(TokenKind::ArrowLeft));
                    }
                    _ => tokens.push(simple(TokenKind::Lt)),
                }
            }
            b'>' => {
                scanner.bump();
                if scanner.peek() == Some(b'=') {
                    scanner.bump();
                    tokens.push(simple(TokenKind::Ge));
                } else {
                    tokens.push(simple(TokenKind::Gt));
                }
            }
            b'-' => {
                scanner.bump();
                if scanner.peek() == Some(b'>') {
                    scanner.bump();
                    tokens.push(simple(TokenKind::ArrowRight));
                } else {
                    tokens.push(simple(TokenKind::Minus));
                }
            }
            b'$' => {
                scanner.bump();
                let start = scanner.pos;
                while scanner.peek().is_some_and(is_word_start) {
                    scanner.bump();
                }
                if scanner.pos == start {
                    return Err(EngineError::syntax(at, "`$` must start a variable name"));
                }
                tokens.push(Token {
                    kind: TokenKind::Variable,
                    at,
                    text: src[start..scanner.pos].to_string(),
                });
            }
            b'"' => {
                scanner.bump();
                let mut text = String::new();
                loop {
                    match scanner.bump() {
                        None => {
                            return Err(EngineError::syntax(at, "unterminated string"));
                        }
                        Some(b'"') => break,
                        Some(b'\\') => match scanner.bump() {
                            Some(b'"') => text.push('"'),
                            Some(b'\\') => text.push('\\'),
                            Some(b'n') => text.push('\n'),
                            Some(other) => {
                                return Err(EngineError::syntax(
                                    scanner.pos - 1,
                                    format!("unknown escape `\\{}`", other as char),
                                ));
                            }
                            None => {
                                return Err(EngineError::syntax(at, "unterminated string"));
                            }
                        },
                        Some(byte) => {
                            // Strings are UTF-8; collect the raw bytes and
                            // validate at the end of the literal.
                            text.push(byte as char);
                            if !byte.is_ascii() {
                                let start = scanner.pos - 1;
                                while scanner.peek().is_some_and(|b| !b.is_ascii()) {
                                    scanner.bump();
                                }
                                text.pop();
                                text.push_str(
                                    std::str::from_utf8(&scanner.src[start..scanner.pos])
                                        .map_err(|_| {
                                            EngineError::syntax(start, "invalid UTF-8")
                                        })?,
                                );
                            }
                        }
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::String,
                    at,
                    text,
                });
            }
            b if is_word_start(b) => {
                let start = scanner.pos;
                scanner.bump();
                loop {
                    match scanner.peek() {
                        Some(b'-')
                            if scanner.peek2().is_some_and(|n| n.is_ascii_alphanumeric()) =>
                        {
                            scanner.bump();
                            scanner.bump();
                        }
                        Some(c) if is_word_continue(c) => {
                            scanner.bump();
                        }
                        _ => break,
                    }
                }
                tokens.push(Token {
                    kind: TokenKind::Word,
                    at,
                    text: src[start..scanner.pos].to_string(),
                });
            }
            other => {
                return Err(EngineError::syntax(
                    at,
                    format!("unexpected character `{}`", other as char),
                ));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn operators_and_arrows() {
        use TokenKind::*;
        assert_eq!(
            kinds("a=b a!=b a~=b a<b a<=b a>b a>=b -> <-"),
            vec![
                Word, Eq, Word, Word, Ne, Word, Word, Match, Word, Word, Lt, Word, Word,
                Le, Word, Word, Gt, Word, Word, Ge, Word, ArrowRight, ArrowLeft
            ]
        );
    }

    #[test]
    fn words_keep_inner_dashes() {
        let tokens = tokenize("estimate-count value-comparator sort=(-value)").unwrap();
        assert_eq!(tokens[0].text, "estimate-count");
        assert_eq!(tokens[1].text, "value-comparator");
        let minus = tokens.iter().find(|t| t.kind == TokenKind::Minus);
        assert!(minus.is_some(), "{tokens:?}");
    }

    #[test]
    fn strings_unescape() {
        let tokens = tokenize(r#"name="say \"hi\"\n""#).unwrap();
        assert_eq!(tokens[2].kind, TokenKind::String);
        assert_eq!(tokens[2].text, "say \"hi\"\n");
    }

    #[test]
    fn variables() {
        let tokens = tokenize("$x=value result=($x)").unwrap();
        assert_eq!(tokens[0].kind, TokenKind::Variable);
        assert_eq!(tokens[0].text, "x");
    }

    #[test]
    fn errors_carry_offsets() {
        match tokenize("name=\"open").unwrap_err() {
            EngineError::Syntax { at, .. } => assert_eq!(at, 5),
            other => panic!("unexpected {other:?}"),
        }
        assert!(tokenize("a # b").is_err());
    }

    #[test]
    fn timestamps_lex_as_one_word() {
        let tokens = tokenize("timestamp>2006-01-02T15:04:05.0000Z").unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[2].text, "2006-01-02T15:04:05.0000Z");
    }
}
