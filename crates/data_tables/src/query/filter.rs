//! The subset of OData `$filter` expressions the table service accepts:
//! comparisons between fields and literals combined with `and`, `or`, `not`
//! and parentheses.

use std::{
    borrow::Cow,
    cmp::Ordering,
    fmt,
    iter::Peekable,
    str::CharIndices,
};

use chrono::{
    DateTime,
    NaiveDateTime,
};
use errors::ErrorMetadata;
use uuid::Uuid;

use super::compare_same_family;
use crate::entity::{
    Entity,
    EntityValue,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering.is_eq(),
            CompareOp::Ne => ordering.is_ne(),
            CompareOp::Gt => ordering.is_gt(),
            CompareOp::Ge => ordering.is_ge(),
            CompareOp::Lt => ordering.is_lt(),
            CompareOp::Le => ordering.is_le(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Field(String),
    Literal(EntityValue),
    Null,
}

impl Operand {
    fn resolve<'a>(&'a self, entity: &'a Entity) -> Option<Cow<'a, EntityValue>> {
        match self {
            Operand::Field(name) => entity.lookup(name),
            Operand::Literal(value) => Some(Cow::Borrowed(value)),
            Operand::Null => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let tokens = Lexer::new(s).tokenize()?;
        let mut parser = Parser {
            source: s,
            tokens,
            pos: 0,
        };
        let filter = parser.parse_or()?;
        if let Some(token) = parser.tokens.get(parser.pos) {
            return Err(parser.error(format!("unexpected {token} after a complete expression")));
        }
        Ok(filter)
    }

    /// Evaluates the filter against an entity. A comparison involving a
    /// missing field, or values of unrelated types, is false.
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Filter::Compare { left, op, right } => {
                match (left, right) {
                    (Operand::Null, other) | (other, Operand::Null) => {
                        let present = other.resolve(entity).is_some();
                        match op {
                            CompareOp::Eq => !present,
                            CompareOp::Ne => present,
                            _ => false,
                        }
                    },
                    _ => {
                        let (Some(l), Some(r)) = (left.resolve(entity), right.resolve(entity))
                        else {
                            return false;
                        };
                        compare_same_family(&l, &r).is_some_and(|ordering| op.holds(ordering))
                    },
                }
            },
            Filter::And(a, b) => a.matches(entity) && b.matches(entity),
            Filter::Or(a, b) => a.matches(entity) || b.matches(entity),
            Filter::Not(inner) => !inner.matches(entity),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    LParen,
    RParen,
    Word(String),
    Literal(EntityValue),
    Null,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Word(w) => write!(f, "{w:?}"),
            Token::Literal(v) => write!(f, "literal {v}"),
            Token::Null => write!(f, "null"),
        }
    }
}

fn invalid_filter(source: &str, detail: impl fmt::Display) -> anyhow::Error {
    ErrorMetadata::bad_request(
        "InvalidFilter",
        format!("Invalid filter {source:?}: {detail}"),
    )
    .into()
}

struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    fn tokenize(mut self) -> anyhow::Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(&(start, c)) = self.chars.peek() {
            let token = match c {
                c if c.is_whitespace() => {
                    self.chars.next();
                    continue;
                },
                '(' => {
                    self.chars.next();
                    Token::LParen
                },
                ')' => {
                    self.chars.next();
                    Token::RParen
                },
                '\'' => Token::Literal(EntityValue::String(self.quoted()?)),
                c if c.is_ascii_digit() || c == '-' => self.number(start)?,
                c if c.is_ascii_alphabetic() || c == '_' => self.word(start)?,
                other => {
                    return Err(invalid_filter(
                        self.source,
                        format!("unexpected character {other:?} at {start}"),
                    ))
                },
            };
            tokens.push(token);
        }
        Ok(tokens)
    }

    /// Reads a single-quoted string. Two quotes in a row stand for one.
    fn quoted(&mut self) -> anyhow::Result<String> {
        let Some((start, _)) = self.chars.next() else {
            return Err(invalid_filter(self.source, "expected a quoted string"));
        };
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some((_, '\'')) => {
                    if matches!(self.chars.peek(), Some((_, '\''))) {
                        self.chars.next();
                        value.push('\'');
                    } else {
                        return Ok(value);
                    }
                },
                Some((_, c)) => value.push(c),
                None => {
                    return Err(invalid_filter(
                        self.source,
                        format!("unterminated string starting at {start}"),
                    ))
                },
            }
        }
    }

    fn take_while(&mut self, mut pred: impl FnMut(char) -> bool) -> usize {
        let mut end = self.source.len();
        while let Some(&(i, c)) = self.chars.peek() {
            if !pred(c) {
                end = i;
                break;
            }
            self.chars.next();
        }
        end
    }

    fn number(&mut self, start: usize) -> anyhow::Result<Token> {
        let source = self.source;
        self.chars.next();
        let mut end = self.take_while(|c| c.is_ascii_digit());
        let mut is_double = false;
        if matches!(self.chars.peek(), Some((_, '.'))) {
            is_double = true;
            self.chars.next();
            end = self.take_while(|c| c.is_ascii_digit());
        }
        if matches!(self.chars.peek(), Some((_, 'e' | 'E'))) {
            is_double = true;
            self.chars.next();
            if matches!(self.chars.peek(), Some((_, '+' | '-'))) {
                self.chars.next();
            }
            end = self.take_while(|c| c.is_ascii_digit());
        }
        let text = &source[start..end];
        let suffix = match self.chars.peek() {
            Some(&(_, c @ ('L' | 'l' | 'd' | 'D' | 'f' | 'F' | 'm' | 'M'))) => {
                self.chars.next();
                Some(c.to_ascii_uppercase())
            },
            _ => None,
        };
        if let Some(&(i, c)) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                return Err(invalid_filter(
                    source,
                    format!("unexpected character {c:?} at {i} in a number"),
                ));
            }
        }
        let invalid = || invalid_filter(source, format!("invalid number {text:?}"));
        let value = match suffix {
            Some('L') if !is_double => {
                EntityValue::Int64(text.parse().map_err(|_| invalid())?)
            },
            Some('L') => return Err(invalid()),
            Some(_) => EntityValue::Double(text.parse().map_err(|_| invalid())?),
            None if is_double => EntityValue::Double(text.parse().map_err(|_| invalid())?),
            None => {
                let value: i64 = text.parse().map_err(|_| invalid())?;
                match i32::try_from(value) {
                    Ok(value) => EntityValue::Int32(value),
                    Err(_) => EntityValue::Int64(value),
                }
            },
        };
        Ok(Token::Literal(value))
    }

    fn word(&mut self, start: usize) -> anyhow::Result<Token> {
        let source = self.source;
        let end = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        let word = &source[start..end];
        if matches!(self.chars.peek(), Some((_, '\''))) {
            let text = self.quoted()?;
            let invalid = |e: &dyn fmt::Display| {
                invalid_filter(source, format!("invalid {word} literal '{text}': {e}"))
            };
            let value = match word {
                "datetime" => match DateTime::parse_from_rfc3339(&text) {
                    Ok(dt) => EntityValue::DateTimeOffset(dt),
                    Err(_) => EntityValue::DateTime(
                        NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
                            .map_err(|e| invalid(&e))?,
                    ),
                },
                "guid" => EntityValue::Guid(Uuid::parse_str(&text).map_err(|e| invalid(&e))?),
                "X" | "binary" => {
                    EntityValue::Binary(decode_hex(&text).map_err(|e| invalid(&e))?)
                },
                _ => {
                    return Err(invalid_filter(
                        source,
                        format!("unknown literal prefix {word:?}"),
                    ))
                },
            };
            return Ok(Token::Literal(value));
        }
        Ok(match word {
            "true" => Token::Literal(EntityValue::Boolean(true)),
            "false" => Token::Literal(EntityValue::Boolean(false)),
            "null" => Token::Null,
            _ => Token::Word(word.to_string()),
        })
    }
}

fn decode_hex(text: &str) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(text.len() % 2 == 0, "odd number of hex digits");
    (0..text.len())
        .step_by(2)
        .map(|i| {
            text.get(i..i + 2)
                .and_then(|byte| u8::from_str_radix(byte, 16).ok())
                .ok_or_else(|| anyhow::anyhow!("invalid hex digits at {i}"))
        })
        .collect()
}

const KEYWORDS: &[&str] = &["and", "or", "not", "eq", "ne", "gt", "ge", "lt", "le"];

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, detail: impl fmt::Display) -> anyhow::Error {
        invalid_filter(self.source, detail)
    }

    fn peek_word(&self, keyword: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Word(w)) if w == keyword)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> anyhow::Result<Filter> {
        let mut left = self.parse_and()?;
        while self.peek_word("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Filter::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> anyhow::Result<Filter> {
        let mut left = self.parse_unary()?;
        while self.peek_word("and") {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Filter::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> anyhow::Result<Filter> {
        if self.peek_word("not") {
            self.pos += 1;
            return Ok(Filter::Not(Box::new(self.parse_unary()?)));
        }
        if self.tokens.get(self.pos) == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            return match self.next() {
                Some(Token::RParen) => Ok(inner),
                Some(other) => Err(self.error(format!("expected ')' but found {other}"))),
                None => Err(self.error("missing ')'")),
            };
        }
        let left = self.parse_operand()?;
        let op = match self.next() {
            Some(Token::Word(w)) => w.parse::<CompareOp>().map_err(|_| {
                self.error(format!("expected a comparison operator but found {w:?}"))
            })?,
            Some(other) => {
                return Err(self.error(format!(
                    "expected a comparison operator but found {other}"
                )))
            },
            None => return Err(self.error("expected a comparison operator")),
        };
        let right = self.parse_operand()?;
        Ok(Filter::Compare { left, op, right })
    }

    fn parse_operand(&mut self) -> anyhow::Result<Operand> {
        match self.next() {
            Some(Token::Word(w)) if !KEYWORDS.contains(&w.as_str()) => Ok(Operand::Field(w)),
            Some(Token::Literal(value)) => Ok(Operand::Literal(value)),
            Some(Token::Null) => Ok(Operand::Null),
            Some(other) => Err(self.error(format!(
                "expected a field or a literal but found {other}"
            ))),
            None => Err(self.error("expected a field or a literal")),
        }
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use super::*;

    fn person() -> Entity {
        Entity::new("P1", "1")
            .with_field("FirstName", "Bobby")
            .with_field("LastName", "O'Hara")
            .with_field("Age", 42)
            .with_field("Score", 7.5)
            .with_field("Active", true)
    }

    #[test]
    fn test_comparisons() -> anyhow::Result<()> {
        let entity = person();
        for (filter, expected) in [
            ("FirstName eq 'Bobby'", true),
            ("LastName eq 'O''Hara'", true),
            ("Age gt 40", true),
            ("Age ge 42L", true),
            ("Age lt 42", false),
            ("Score le 7.5", true),
            ("Score gt 7", true),
            ("Active eq true", true),
            ("Active ne true", false),
            ("Age eq '42'", false),
            ("Missing eq 'x'", false),
            ("Missing ne 'x'", false),
            ("Missing eq null", true),
            ("FirstName ne null", true),
            ("'Bobby' eq FirstName", true),
        ] {
            assert_eq!(Filter::parse(filter)?.matches(&entity), expected, "{filter}");
        }
        Ok(())
    }

    #[test]
    fn test_boolean_structure() -> anyhow::Result<()> {
        let entity = person();
        for (filter, expected) in [
            ("Age gt 40 and FirstName eq 'Bobby'", true),
            ("Age gt 50 or FirstName eq 'Bobby'", true),
            ("not (Age gt 40)", false),
            ("not Age gt 40 or Active eq true", true),
            ("(Age gt 50 or Age lt 10) and Active eq true", false),
            ("Age gt 50 or Age lt 10 and Active eq true", false),
            ("Age gt 10 or Age gt 50 and Active eq false", true),
        ] {
            assert_eq!(Filter::parse(filter)?.matches(&entity), expected, "{filter}");
        }
        Ok(())
    }

    #[test]
    fn test_typed_literals() -> anyhow::Result<()> {
        let entity = Entity::new("P1", "1")
            .with_field("Born", DateTime::parse_from_rfc3339("1990-05-01T00:00:00Z")?)
            .with_field("Id", Uuid::nil())
            .with_field("Data", vec![0xdeu8, 0xad])
            .with_field("Big", 1i64 << 40);
        for filter in [
            "Born lt datetime'2000-01-01T00:00:00Z'",
            "Born eq datetime'1990-05-01T00:00:00'",
            "Id eq guid'00000000-0000-0000-0000-000000000000'",
            "Data eq X'dead'",
            "Data eq binary'DEAD'",
            "Big gt 1099511627775",
            "Big eq 1099511627776L",
        ] {
            assert!(Filter::parse(filter)?.matches(&entity), "{filter}");
        }
        Ok(())
    }

    #[test]
    fn test_parse_errors() {
        for filter in [
            "",
            "Age",
            "Age gt",
            "Age eq 1 and",
            "(Age eq 1",
            "Age eq 1)",
            "Name eq 'unterminated",
            "Age between 1",
            "Age eq 1.5L",
            "Id eq uuid'1'",
            "Data eq X'abc'",
            "Age eq 12abc",
            "and eq 1",
            "Age # 1",
        ] {
            let err = Filter::parse(filter).unwrap_err();
            assert!(err.is_bad_request(), "{filter}");
            assert_eq!(err.short_msg(), "InvalidFilter", "{filter}");
        }
    }

    #[test]
    fn test_reserved_slots_are_filterable() -> anyhow::Result<()> {
        let mut entity = person();
        entity.set_timestamp(Some(DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")?));
        assert!(Filter::parse("Timestamp ge datetime'2023-12-31T00:00:00Z'")?.matches(&entity));
        Ok(())
    }
}
