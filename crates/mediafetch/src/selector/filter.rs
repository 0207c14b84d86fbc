use crate::descriptor::StreamDescriptor;

/// Attribute a bracket filter compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKey {
    Height,
    Width,
    Tbr,
    Abr,
    Vbr,
    Filesize,
    Fps,
    Container,
    Vcodec,
    Acodec,
    Protocol,
    Id,
    Language,
    FormatNote,
}

impl FilterKey {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "height" => Self::Height,
            "width" => Self::Width,
            "tbr" | "bitrate" => Self::Tbr,
            "abr" => Self::Abr,
            "vbr" => Self::Vbr,
            "filesize" | "size" => Self::Filesize,
            "fps" => Self::Fps,
            "ext" | "container" => Self::Container,
            "vcodec" => Self::Vcodec,
            "acodec" => Self::Acodec,
            "protocol" => Self::Protocol,
            "id" | "format_id" => Self::Id,
            "language" | "lang" => Self::Language,
            "format_note" => Self::FormatNote,
            _ => return None,
        })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Height
                | Self::Width
                | Self::Tbr
                | Self::Abr
                | Self::Vbr
                | Self::Filesize
                | Self::Fps
        )
    }

    fn number(&self, stream: &StreamDescriptor) -> Option<f64> {
        match self {
            Self::Height => stream.height.map(f64::from),
            Self::Width => stream.width.map(f64::from),
            Self::Tbr => stream.bitrate(),
            Self::Abr => stream.abr,
            Self::Vbr => stream.vbr,
            Self::Filesize => stream.declared_size().map(|s| s as f64),
            Self::Fps => stream.fps,
            _ => None,
        }
    }

    fn text<'a>(&self, stream: &'a StreamDescriptor) -> Option<&'a str> {
        match self {
            Self::Container => Some(stream.container.as_str()),
            Self::Vcodec => stream.vcodec.as_deref(),
            Self::Acodec => stream.acodec.as_deref(),
            Self::Protocol => Some(stream.protocol.as_str()),
            Self::Id => Some(stream.id.as_str()),
            Self::Language => stream.language.as_deref(),
            Self::FormatNote => stream.format_note.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    StartsWith,
    EndsWith,
    Contains,
    NotStartsWith,
    NotEndsWith,
    NotContains,
}

impl Op {
    const TOKENS: [(&'static str, Op); 12] = [
        ("!^=", Op::NotStartsWith),
        ("!$=", Op::NotEndsWith),
        ("!*=", Op::NotContains),
        ("!=", Op::Ne),
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("^=", Op::StartsWith),
        ("$=", Op::EndsWith),
        ("*=", Op::Contains),
        ("=", Op::Eq),
        ("<", Op::Lt),
        (">", Op::Gt),
    ];

    /// Longest operator at the start of `input`, with its length in bytes.
    pub fn parse_prefix(input: &str) -> Option<(Self, usize)> {
        Self::TOKENS
            .iter()
            .find(|(token, _)| input.starts_with(*token))
            .map(|(token, op)| (*op, token.len()))
    }

    pub fn as_str(&self) -> &'static str {
        Self::TOKENS
            .iter()
            .find(|(_, op)| op == self)
            .map_or("?", |(token, _)| *token)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    pub fn is_textual(&self) -> bool {
        !matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

/// One `key op value` comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub key: FilterKey,
    pub op: Op,
    pub value: Value,
    /// Written as `op?`: a stream without the attribute passes.
    pub allow_missing: bool,
}

impl Condition {
    pub fn matches(&self, stream: &StreamDescriptor) -> bool {
        match &self.value {
            Value::Number(expected) => match self.key.number(stream) {
                Some(actual) => compare_numbers(self.op, actual, *expected),
                None => self.allow_missing,
            },
            Value::Text(expected) => match self.key.text(stream) {
                Some(actual) => compare_text(self.op, actual, expected),
                None => self.allow_missing,
            },
        }
    }
}

fn compare_numbers(op: Op, actual: f64, expected: f64) -> bool {
    match op {
        Op::Eq => actual == expected,
        Op::Ne => actual != expected,
        Op::Lt => actual < expected,
        Op::Le => actual <= expected,
        Op::Gt => actual > expected,
        Op::Ge => actual >= expected,
        _ => false,
    }
}

fn compare_text(op: Op, actual: &str, expected: &str) -> bool {
    match op {
        Op::Eq => actual == expected,
        Op::Ne => actual != expected,
        Op::StartsWith => actual.starts_with(expected),
        Op::EndsWith => actual.ends_with(expected),
        Op::Contains => actual.contains(expected),
        Op::NotStartsWith => !actual.starts_with(expected),
        Op::NotEndsWith => !actual.ends_with(expected),
        Op::NotContains => !actual.contains(expected),
        Op::Lt | Op::Le | Op::Gt | Op::Ge => false,
    }
}

/// Whether `stream` passes every group, where a group passes when any of its
/// conditions does.
pub fn passes(filters: &[Vec<Condition>], stream: &StreamDescriptor) -> bool {
    filters
        .iter()
        .all(|group| group.iter().any(|condition| condition.matches(stream)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TrackType;

    fn stream() -> StreamDescriptor {
        StreamDescriptor::progressive("22", "http://h/v.mp4", TrackType::Combined)
            .with_height(720)
            .with_tbr(1500.0)
            .with_codecs(Some("avc1.64001F"), Some("mp4a.40.2"))
    }

    fn cond(key: FilterKey, op: Op, value: Value, allow_missing: bool) -> Condition {
        Condition {
            key,
            op,
            value,
            allow_missing,
        }
    }

    #[test]
    fn numeric_comparisons() {
        let s = stream();
        assert!(cond(FilterKey::Height, Op::Le, Value::Number(720.0), false).matches(&s));
        assert!(!cond(FilterKey::Height, Op::Lt, Value::Number(720.0), false).matches(&s));
        assert!(cond(FilterKey::Tbr, Op::Gt, Value::Number(1000.0), false).matches(&s));
    }

    #[test]
    fn missing_attribute_needs_question_mark() {
        let s = stream();
        assert!(!cond(FilterKey::Fps, Op::Ge, Value::Number(30.0), false).matches(&s));
        assert!(cond(FilterKey::Fps, Op::Ge, Value::Number(30.0), true).matches(&s));
    }

    #[test]
    fn text_comparisons() {
        let s = stream();
        let text = |t: &str| Value::Text(t.to_string());
        assert!(cond(FilterKey::Vcodec, Op::StartsWith, text("avc1"), false).matches(&s));
        assert!(cond(FilterKey::Container, Op::Eq, text("mp4"), false).matches(&s));
        assert!(cond(FilterKey::Acodec, Op::NotContains, text("opus"), false).matches(&s));
        assert!(!cond(FilterKey::Id, Op::EndsWith, text("3"), false).matches(&s));
    }

    #[test]
    fn groups_are_or_inside_and_across() {
        let s = stream();
        let text = |t: &str| Value::Text(t.to_string());
        let filters = vec![
            vec![
                cond(FilterKey::Container, Op::Eq, text("webm"), false),
                cond(FilterKey::Container, Op::Eq, text("mp4"), false),
            ],
            vec![cond(FilterKey::Height, Op::Ge, Value::Number(480.0), false)],
        ];
        assert!(passes(&filters, &s));
        let filters = vec![vec![cond(FilterKey::Container, Op::Eq, text("webm"), false)]];
        assert!(!passes(&filters, &s));
    }

    #[test]
    fn operator_prefix_prefers_longest() {
        assert_eq!(Op::parse_prefix("<=5"), Some((Op::Le, 2)));
        assert_eq!(Op::parse_prefix("!*=x"), Some((Op::NotContains, 3)));
        assert_eq!(Op::parse_prefix("=x"), Some((Op::Eq, 1)));
        assert_eq!(Op::parse_prefix("~x"), None);
    }
}
