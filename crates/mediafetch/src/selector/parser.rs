//! Parser for format-selection expressions.
//!
//! ```text
//! expression  := alternative ( "/" alternative )*
//! alternative := atom ( "+" atom )*
//! atom        := [ name ] filter*          (at least one of the two)
//! filter      := "[" condition ( "|" condition )* "]"
//! condition   := key op [ "?" ] value
//! ```
//!
//! `name` is a keyword (`best`, `worst`, `bestvideo`, `worstvideo`,
//! `bestaudio`, `worstaudio`), a stream id, or a container name.

use crate::error::EngineError;

use super::filter::{Condition, FilterKey, Op, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Base {
    Best,
    Worst,
    BestVideo,
    WorstVideo,
    BestAudio,
    WorstAudio,
    /// A stream id, or failing that a container name.
    Named(String),
}

impl Base {
    fn from_word(word: &str) -> Self {
        match word {
            "best" | "b" => Self::Best,
            "worst" | "w" => Self::Worst,
            "bestvideo" | "bv" => Self::BestVideo,
            "worstvideo" | "wv" => Self::WorstVideo,
            "bestaudio" | "ba" => Self::BestAudio,
            "worstaudio" | "wa" => Self::WorstAudio,
            other => Self::Named(other.to_string()),
        }
    }
}

/// Conditions inside one bracket, OR-ed together.
pub type FilterGroup = Vec<Condition>;

#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    pub base: Base,
    /// Every group must hold.
    pub filters: Vec<FilterGroup>,
}

/// Members of one alternative, joined by `+`.
#[derive(Debug, Clone, PartialEq)]
pub struct Alternative {
    pub atoms: Vec<Atom>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub source: String,
    pub alternatives: Vec<Alternative>,
}

pub fn parse(source: &str) -> Result<Expression, EngineError> {
    let mut parser = Parser {
        source,
        chars: source.char_indices().collect(),
        pos: 0,
    };
    let expression = parser.expression()?;
    parser.skip_ws();
    if let Some(c) = parser.peek() {
        return Err(parser.error(format!("unexpected `{c}`")));
    }
    Ok(expression)
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).map(|(_, c)| *c)
    }

    fn offset(&self) -> usize {
        self.chars
            .get(self.pos)
            .map_or(self.source.len(), |(offset, _)| *offset)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn error(&self, reason: impl Into<String>) -> EngineError {
        self.error_at(self.offset(), reason)
    }

    fn error_at(&self, position: usize, reason: impl Into<String>) -> EngineError {
        EngineError::InvalidExpression {
            expression: self.source.to_string(),
            position,
            reason: reason.into(),
        }
    }

    fn expression(&mut self) -> Result<Expression, EngineError> {
        let mut alternatives = vec![self.alternative()?];
        loop {
            self.skip_ws();
            if self.peek() != Some('/') {
                break;
            }
            self.bump();
            alternatives.push(self.alternative()?);
        }
        Ok(Expression {
            source: self.source.to_string(),
            alternatives,
        })
    }

    fn alternative(&mut self) -> Result<Alternative, EngineError> {
        let mut atoms = vec![self.atom()?];
        loop {
            self.skip_ws();
            if self.peek() != Some('+') {
                break;
            }
            self.bump();
            atoms.push(self.atom()?);
        }
        Ok(Alternative { atoms })
    }

    fn atom(&mut self) -> Result<Atom, EngineError> {
        self.skip_ws();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().map(|(_, c)| c).collect();

        let mut filters = Vec::new();
        while self.peek() == Some('[') {
            filters.push(self.filter_group()?);
        }

        if word.is_empty() {
            if filters.is_empty() {
                return Err(match self.peek() {
                    Some(c) => self.error(format!("expected a format name or filter, found `{c}`")),
                    None => self.error("expected a format name or filter"),
                });
            }
            // A bare filter applies to `best`.
            return Ok(Atom {
                base: Base::Best,
                filters,
            });
        }

        Ok(Atom {
            base: Base::from_word(&word),
            filters,
        })
    }

    fn filter_group(&mut self) -> Result<FilterGroup, EngineError> {
        let open = self.offset();
        self.bump();
        let start = self.pos;
        while self.peek().is_some_and(|c| c != ']') {
            self.pos += 1;
        }
        if self.peek() != Some(']') {
            return Err(self.error_at(open, "unterminated `[`"));
        }
        let end = self.pos;
        self.bump();

        let mut group = Vec::new();
        let mut cond_start = start;
        for i in start..=end {
            if i == end || self.chars[i].1 == '|' {
                let offset = self.chars.get(cond_start).map_or(self.source.len(), |(o, _)| *o);
                let text: String = self.chars[cond_start..i].iter().map(|(_, c)| c).collect();
                group.push(self.condition(&text, offset)?);
                cond_start = i + 1;
            }
        }
        Ok(group)
    }

    fn condition(&self, text: &str, offset: usize) -> Result<Condition, EngineError> {
        let trimmed = text.trim_start();
        let offset = offset + (text.len() - trimmed.len());
        let text = trimmed.trim_end();
        if text.is_empty() {
            return Err(self.error_at(offset, "empty filter"));
        }

        let key_len = text
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(text.len());
        let key_name = &text[..key_len];
        let key = FilterKey::parse(key_name)
            .ok_or_else(|| self.error_at(offset, format!("unknown filter key `{key_name}`")))?;

        let rest = text[key_len..].trim_start();
        let op_offset = offset + (text.len() - rest.len());
        let (op, op_len) = Op::parse_prefix(rest)
            .ok_or_else(|| self.error_at(op_offset, "expected a comparison operator"))?;
        let mut rest = &rest[op_len..];

        let allow_missing = rest.starts_with('?');
        if allow_missing {
            rest = &rest[1..];
        }
        let raw = rest.trim();
        if raw.is_empty() {
            return Err(self.error_at(op_offset, "missing filter value"));
        }

        let value = if key.is_numeric() {
            if !op.is_numeric() {
                return Err(self.error_at(
                    op_offset,
                    format!("operator `{}` needs a text key, `{key_name}` is numeric", op.as_str()),
                ));
            }
            Value::Number(parse_number(raw).ok_or_else(|| {
                self.error_at(op_offset, format!("`{raw}` is not a number"))
            })?)
        } else {
            if !op.is_textual() {
                return Err(self.error_at(
                    op_offset,
                    format!("operator `{}` needs a numeric key, `{key_name}` is text", op.as_str()),
                ));
            }
            Value::Text(raw.to_string())
        };

        Ok(Condition {
            key,
            op,
            value,
            allow_missing,
        })
    }
}

/// Parse a number with an optional size suffix: `k`/`M`/`G` (powers of 1000),
/// `Ki`/`Mi`/`Gi` (powers of 1024), optionally followed by `B`.
pub fn parse_number(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let digits_end = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let number: f64 = raw[..digits_end].parse().ok()?;
    let suffix = raw[digits_end..].trim();
    let suffix = suffix.strip_suffix(['B', 'b']).unwrap_or(suffix);
    let multiplier = match suffix {
        "" => 1.0,
        "k" | "K" => 1e3,
        "M" | "m" => 1e6,
        "G" | "g" => 1e9,
        "Ki" | "KI" | "ki" => 1024.0,
        "Mi" | "MI" | "mi" => 1024.0 * 1024.0,
        "Gi" | "GI" | "gi" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(number * multiplier)
}
