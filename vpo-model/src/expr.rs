//! The policy predicate expression language.
//!
//! Conditional rules may spell their `when` predicate as an infix string:
//!
//! ```text
//! exists(audio, language==eng) and count(audio, not_commentary)>=2
//! ```
//!
//! Expressions parse into the same [`Condition`] algebra as the structured
//! YAML form, at policy-load time, so syntax errors surface before any file
//! is touched. Precedence is `or` < `and` < `not` < comparison < primary.
//! Keywords (`and`, `or`, `not`, `in`, `true`, `false`) are case-sensitive;
//! identifiers are not.
//!
//! [`unparse`] renders a condition back to an expression string such that
//! `parse(unparse(c)) == c` for every condition the parser can produce.

use std::fmt;

use serde_json::Value;

use crate::policy::conditions::{
    BoolOrClassification, ClassificationSpec, CompareOp, Comparison, Condition,
    IntOrCompare, StringOrList, TitleMatch, TrackSelector,
};
use crate::probe::TrackKind;
use crate::units::parse_size_literal;

/// Lex or parse failure, with the byte offset it occurred at.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("at byte {pos}: {message}")]
pub struct ExprError {
    pub pos: usize,
    pub message: String,
}

impl ExprError {
    fn new(pos: usize, message: impl Into<String>) -> Self {
        Self { pos, message: message.into() }
    }
}

type Result<T> = std::result::Result<T, ExprError>;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(f64),
    /// Size literal resolved to bytes (`15M`, `1.5GB`, `192k`).
    Size(u64),
    Str(String),
    Bool(bool),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    OpEq,
    OpNeq,
    OpLt,
    OpLte,
    OpGt,
    OpGte,
    KwIn,
    KwAnd,
    KwOr,
    KwNot,
    Eof,
}

impl fmt::Display for Tok {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tok::Ident(s) => write!(f, "identifier {s:?}"),
            Tok::Number(n) => write!(f, "number {n}"),
            Tok::Size(n) => write!(f, "size literal ({n} bytes)"),
            Tok::Str(s) => write!(f, "string {s:?}"),
            Tok::Bool(b) => write!(f, "boolean {b}"),
            Tok::LParen => f.write_str("'('"),
            Tok::RParen => f.write_str("')'"),
            Tok::LBracket => f.write_str("'['"),
            Tok::RBracket => f.write_str("']'"),
            Tok::Comma => f.write_str("','"),
            Tok::OpEq => f.write_str("'=='"),
            Tok::OpNeq => f.write_str("'!='"),
            Tok::OpLt => f.write_str("'<'"),
            Tok::OpLte => f.write_str("'<='"),
            Tok::OpGt => f.write_str("'>'"),
            Tok::OpGte => f.write_str("'>='"),
            Tok::KwIn => f.write_str("'in'"),
            Tok::KwAnd => f.write_str("'and'"),
            Tok::KwOr => f.write_str("'or'"),
            Tok::KwNot => f.write_str("'not'"),
            Tok::Eof => f.write_str("end of input"),
        }
    }
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, bytes: src.as_bytes(), pos: 0 }
    }

    fn tokenize(mut self) -> Result<Vec<(Tok, usize)>> {
        let mut out = Vec::new();
        loop {
            self.skip_whitespace();
            let start = self.pos;
            let Some(&c) = self.bytes.get(self.pos) else {
                out.push((Tok::Eof, start));
                return Ok(out);
            };
            let tok = match c {
                b'(' => { self.pos += 1; Tok::LParen }
                b')' => { self.pos += 1; Tok::RParen }
                b'[' => { self.pos += 1; Tok::LBracket }
                b']' => { self.pos += 1; Tok::RBracket }
                b',' => { self.pos += 1; Tok::Comma }
                b'=' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        Tok::OpEq
                    } else {
                        return Err(ExprError::new(start, "expected '==' (single '=' is not an operator)"));
                    }
                }
                b'!' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        Tok::OpNeq
                    } else {
                        return Err(ExprError::new(start, "expected '!='"));
                    }
                }
                b'<' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        Tok::OpLte
                    } else {
                        self.pos += 1;
                        Tok::OpLt
                    }
                }
                b'>' => {
                    if self.bytes.get(self.pos + 1) == Some(&b'=') {
                        self.pos += 2;
                        Tok::OpGte
                    } else {
                        self.pos += 1;
                        Tok::OpGt
                    }
                }
                b'"' | b'\'' => self.lex_string(c)?,
                b'0'..=b'9' => self.lex_number()?,
                c if c.is_ascii_alphabetic() || c == b'_' => self.lex_word(),
                other => {
                    return Err(ExprError::new(
                        start,
                        format!("unexpected character {:?}", other as char),
                    ));
                }
            };
            out.push((tok, start));
        }
    }

    fn skip_whitespace(&mut self) {
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_whitespace) {
            self.pos += 1;
        }
    }

    fn lex_string(&mut self, quote: u8) -> Result<Tok> {
        let start = self.pos;
        self.pos += 1;
        let content_start = self.pos;
        while let Some(&c) = self.bytes.get(self.pos) {
            if c == quote {
                let text = self.src[content_start..self.pos].to_string();
                self.pos += 1;
                return Ok(Tok::Str(text));
            }
            self.pos += 1;
        }
        Err(ExprError::new(start, "unterminated string literal"))
    }

    fn lex_number(&mut self) -> Result<Tok> {
        let start = self.pos;
        while self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
            self.pos += 1;
        }
        if self.bytes.get(self.pos) == Some(&b'.')
            && self.bytes.get(self.pos + 1).is_some_and(u8::is_ascii_digit)
        {
            self.pos += 1;
            while self.bytes.get(self.pos).is_some_and(u8::is_ascii_digit) {
                self.pos += 1;
            }
        }
        // A trailing unit marks a size literal: 15M, 192k, 1.5GB, 2GiB.
        let unit_start = self.pos;
        while self.bytes.get(self.pos).is_some_and(|c| c.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        let raw = &self.src[start..self.pos];
        if unit_start == self.pos {
            let value: f64 = raw
                .parse()
                .map_err(|_| ExprError::new(start, format!("invalid number {raw:?}")))?;
            Ok(Tok::Number(value))
        } else {
            let bytes = parse_size_literal(raw)
                .map_err(|e| ExprError::new(start, e.to_string()))?;
            Ok(Tok::Size(bytes))
        }
    }

    fn lex_word(&mut self) -> Tok {
        let start = self.pos;
        while self
            .bytes
            .get(self.pos)
            .is_some_and(|&c| c.is_ascii_alphanumeric() || c == b'_' || c == b'-')
        {
            self.pos += 1;
        }
        let word = &self.src[start..self.pos];
        // Keywords are case-sensitive; identifiers are not.
        match word {
            "and" => Tok::KwAnd,
            "or" => Tok::KwOr,
            "not" => Tok::KwNot,
            "in" => Tok::KwIn,
            "true" => Tok::Bool(true),
            "false" => Tok::Bool(false),
            _ => Tok::Ident(word.to_ascii_lowercase()),
        }
    }
}

/// A literal operand in a comparison.
#[derive(Debug, Clone, PartialEq)]
enum Lit {
    Number(f64),
    Size(u64),
    Str(String),
    Bool(bool),
    List(Vec<Lit>),
}

impl Lit {
    fn to_json(&self) -> Value {
        match self {
            Lit::Number(n) => {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    Value::from(*n as i64)
                } else {
                    Value::from(*n)
                }
            }
            Lit::Size(n) => Value::from(*n),
            Lit::Str(s) => Value::from(s.clone()),
            Lit::Bool(b) => Value::from(*b),
            Lit::List(items) => Value::from(
                items.iter().map(Lit::to_json).collect::<Vec<_>>(),
            ),
        }
    }
}

/// What a primary can be before comparison lowering.
#[derive(Debug)]
enum Operand {
    /// Already a complete condition (exists, is_original, bool combinators).
    Cond(Condition),
    /// `count(kind, filters)` awaiting its comparison.
    Count { kind: TrackKind, filters: TrackSelector },
    /// `plugin_metadata(p, f)`; standalone means existence.
    Plugin { plugin: String, field: String },
    /// `container_metadata(f)`; standalone means existence.
    Container { field: String },
    Lit(Lit),
}

struct Parser {
    toks: Vec<(Tok, usize)>,
    idx: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.toks[self.idx].0
    }

    fn pos(&self) -> usize {
        self.toks[self.idx].1
    }

    fn next(&mut self) -> (Tok, usize) {
        let item = self.toks[self.idx].clone();
        if self.idx + 1 < self.toks.len() {
            self.idx += 1;
        }
        item
    }

    fn expect(&mut self, tok: &Tok) -> Result<()> {
        if self.peek() == tok {
            self.next();
            Ok(())
        } else {
            Err(ExprError::new(
                self.pos(),
                format!("expected {tok}, found {}", self.peek()),
            ))
        }
    }

    fn parse_or(&mut self) -> Result<Condition> {
        let mut terms = vec![self.parse_and()?];
        while matches!(self.peek(), Tok::KwOr) {
            self.next();
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Condition::Any(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Condition> {
        let mut terms = vec![self.parse_not()?];
        while matches!(self.peek(), Tok::KwAnd) {
            self.next();
            terms.push(self.parse_not()?);
        }
        Ok(if terms.len() == 1 {
            terms.pop().unwrap()
        } else {
            Condition::All(terms)
        })
    }

    fn parse_not(&mut self) -> Result<Condition> {
        if matches!(self.peek(), Tok::KwNot) {
            self.next();
            let inner = self.parse_not()?;
            Ok(Condition::Not(Box::new(inner)))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Condition> {
        let start = self.pos();
        let left = self.parse_primary()?;

        let op = match self.peek() {
            Tok::OpEq => Some(CompareOp::Eq),
            Tok::OpNeq => Some(CompareOp::Neq),
            Tok::OpLt => Some(CompareOp::Lt),
            Tok::OpLte => Some(CompareOp::Lte),
            Tok::OpGt => Some(CompareOp::Gt),
            Tok::OpGte => Some(CompareOp::Gte),
            Tok::KwIn => None, // handled below
            Tok::Ident(word) if word == "contains" => Some(CompareOp::Contains),
            _ => {
                // No operator: the primary must already be a condition.
                return match left {
                    Operand::Cond(cond) => Ok(cond),
                    Operand::Plugin { plugin, field } => Ok(Condition::PluginMetadata {
                        plugin,
                        field,
                        op: CompareOp::Exists,
                        value: None,
                    }),
                    Operand::Container { field } => Ok(Condition::ContainerMetadata {
                        field,
                        op: CompareOp::Exists,
                        value: None,
                    }),
                    Operand::Count { .. } => Err(ExprError::new(
                        start,
                        "count(...) must be followed by a comparison, e.g. count(audio) >= 2",
                    )),
                    Operand::Lit(_) => Err(ExprError::new(
                        start,
                        "a bare literal is not a condition",
                    )),
                };
            }
        };

        if matches!(self.peek(), Tok::KwIn) {
            self.next();
            let op_pos = self.pos();
            let list = match self.parse_literal()? {
                Lit::List(items) => items,
                _ => return Err(ExprError::new(op_pos, "'in' requires a list on the right")),
            };
            return self.lower_in(left, list, start);
        }

        let op = op.expect("comparison operator present");
        self.next();
        let rhs_pos = self.pos();
        let rhs = self.parse_literal()?;
        self.lower_comparison(left, op, rhs, start, rhs_pos)
    }

    fn lower_in(&mut self, left: Operand, items: Vec<Lit>, start: usize) -> Result<Condition> {
        // `x in [a, b]` expands to a disjunction of equalities.
        let make = |op_target: &Operand, item: &Lit| -> Condition {
            match op_target {
                Operand::Plugin { plugin, field } => Condition::PluginMetadata {
                    plugin: plugin.clone(),
                    field: field.clone(),
                    op: CompareOp::Eq,
                    value: Some(item.to_json()),
                },
                Operand::Container { field } => Condition::ContainerMetadata {
                    field: field.clone(),
                    op: CompareOp::Eq,
                    value: Some(item.to_json()),
                },
                _ => unreachable!("checked by caller"),
            }
        };
        match &left {
            Operand::Plugin { .. } | Operand::Container { .. } => {
                if items.is_empty() {
                    return Err(ExprError::new(start, "'in' list cannot be empty"));
                }
                let mut conds: Vec<Condition> =
                    items.iter().map(|item| make(&left, item)).collect();
                Ok(if conds.len() == 1 {
                    conds.pop().unwrap()
                } else {
                    Condition::Any(conds)
                })
            }
            _ => Err(ExprError::new(
                start,
                "'in' applies to plugin_metadata(...) or container_metadata(...)",
            )),
        }
    }

    fn lower_comparison(
        &mut self,
        left: Operand,
        op: CompareOp,
        rhs: Lit,
        start: usize,
        rhs_pos: usize,
    ) -> Result<Condition> {
        match left {
            Operand::Count { kind, filters } => {
                let value = match rhs {
                    Lit::Number(n) if n.fract() == 0.0 => n as i64,
                    Lit::Size(n) => n as i64,
                    _ => {
                        return Err(ExprError::new(
                            rhs_pos,
                            "count comparison requires an integer",
                        ));
                    }
                };
                if matches!(op, CompareOp::Contains) {
                    return Err(ExprError::new(start, "count does not support 'contains'"));
                }
                Ok(Condition::Count { track_kind: kind, filters, op, value })
            }
            Operand::Plugin { plugin, field } => {
                let value = rhs.to_json();
                validate_expr_operand(&op, &value, rhs_pos)?;
                Ok(Condition::PluginMetadata { plugin, field, op, value: Some(value) })
            }
            Operand::Container { field } => {
                let value = rhs.to_json();
                validate_expr_operand(&op, &value, rhs_pos)?;
                Ok(Condition::ContainerMetadata { field, op, value: Some(value) })
            }
            Operand::Cond(_) => Err(ExprError::new(
                start,
                "this condition cannot be compared with an operator",
            )),
            Operand::Lit(_) => Err(ExprError::new(
                start,
                "comparison requires a function call on the left",
            )),
        }
    }

    fn parse_primary(&mut self) -> Result<Operand> {
        let pos = self.pos();
        match self.peek().clone() {
            Tok::LParen => {
                self.next();
                let inner = self.parse_or()?;
                self.expect(&Tok::RParen)?;
                Ok(Operand::Cond(inner))
            }
            Tok::LBracket => Ok(Operand::Lit(self.parse_literal()?)),
            Tok::Number(_) | Tok::Size(_) | Tok::Str(_) | Tok::Bool(_) => {
                Ok(Operand::Lit(self.parse_literal()?))
            }
            Tok::Ident(name) => {
                self.next();
                match name.as_str() {
                    "exists" => {
                        let (kind, filters) = self.parse_track_call()?;
                        Ok(Operand::Cond(Condition::Exists { track_kind: kind, filters }))
                    }
                    "count" => {
                        let (kind, filters) = self.parse_track_call()?;
                        Ok(Operand::Count { kind, filters })
                    }
                    "plugin" | "plugin_metadata" => {
                        self.expect(&Tok::LParen)?;
                        let plugin = self.parse_name("plugin name")?;
                        self.expect(&Tok::Comma)?;
                        let field = self.parse_name("field name")?;
                        self.expect(&Tok::RParen)?;
                        Ok(Operand::Plugin { plugin, field })
                    }
                    "container_metadata" => {
                        self.expect(&Tok::LParen)?;
                        let field = self.parse_name("field name")?;
                        self.expect(&Tok::RParen)?;
                        Ok(Operand::Container { field })
                    }
                    "is_original" => Ok(Operand::Cond(self.parse_classification(true)?)),
                    "is_dubbed" => Ok(Operand::Cond(self.parse_classification(false)?)),
                    "audio_is_multi_language" => {
                        Ok(Operand::Cond(self.parse_multi_language()?))
                    }
                    other => Err(ExprError::new(
                        pos,
                        format!(
                            "unknown function or identifier {other:?}; expected exists, count, \
                             plugin_metadata, container_metadata, is_original, is_dubbed, or \
                             audio_is_multi_language"
                        ),
                    )),
                }
            }
            other => Err(ExprError::new(pos, format!("unexpected {other}"))),
        }
    }

    /// `(kind [, filter]*)` for exists/count.
    fn parse_track_call(&mut self) -> Result<(TrackKind, TrackSelector)> {
        self.expect(&Tok::LParen)?;
        let kind_pos = self.pos();
        let kind_name = self.parse_name("track kind")?;
        let kind = match kind_name.as_str() {
            "video" => TrackKind::Video,
            "audio" => TrackKind::Audio,
            "subtitle" | "subtitles" => TrackKind::Subtitle,
            "attachment" | "attachments" => TrackKind::Attachment,
            "other" => TrackKind::Other,
            other => {
                return Err(ExprError::new(
                    kind_pos,
                    format!("unknown track kind {other:?}"),
                ));
            }
        };
        let mut filters = TrackSelector::default();
        while matches!(self.peek(), Tok::Comma) {
            self.next();
            self.parse_filter(&mut filters)?;
        }
        self.expect(&Tok::RParen)?;
        Ok((kind, filters))
    }

    /// One selector entry: `language==eng`, `language in [eng, jpn]`,
    /// `channels>=6`, `title contains "commentary"`, or a bare flag
    /// (`not_commentary`, `is_default`, `is_forced`).
    fn parse_filter(&mut self, filters: &mut TrackSelector) -> Result<()> {
        let pos = self.pos();
        let key = self.parse_name("filter name")?;

        let bare = !matches!(
            self.peek(),
            Tok::OpEq | Tok::OpNeq | Tok::OpLt | Tok::OpLte | Tok::OpGt | Tok::OpGte | Tok::KwIn
        ) && !matches!(self.peek(), Tok::Ident(w) if w == "contains" || w == "matches");

        if bare {
            match key.as_str() {
                "not_commentary" => filters.not_commentary = Some(true),
                "is_default" | "default" => filters.is_default = Some(true),
                "is_forced" | "forced" => filters.is_forced = Some(true),
                other => {
                    return Err(ExprError::new(
                        pos,
                        format!("filter {other:?} requires an operator"),
                    ));
                }
            }
            return Ok(());
        }

        match key.as_str() {
            "language" | "codec" => {
                let value = self.parse_string_criterion(&key)?;
                if key == "language" {
                    filters.language = Some(value);
                } else {
                    filters.codec = Some(value);
                }
            }
            "channels" | "width" | "height" => {
                let value = self.parse_int_criterion(&key)?;
                match key.as_str() {
                    "channels" => filters.channels = Some(value),
                    "width" => filters.width = Some(value),
                    _ => filters.height = Some(value),
                }
            }
            "is_default" | "default" | "is_forced" | "forced" | "not_commentary" => {
                self.expect(&Tok::OpEq)?;
                let value_pos = self.pos();
                let Lit::Bool(b) = self.parse_literal()? else {
                    return Err(ExprError::new(value_pos, format!("{key} expects true or false")));
                };
                match key.as_str() {
                    "is_default" | "default" => filters.is_default = Some(b),
                    "is_forced" | "forced" => filters.is_forced = Some(b),
                    _ => filters.not_commentary = Some(b),
                }
            }
            "title" => {
                let (op, _) = self.next();
                let value_pos = self.pos();
                let Lit::Str(text) = self.parse_literal()? else {
                    return Err(ExprError::new(value_pos, "title match expects a string"));
                };
                match op {
                    Tok::Ident(w) if w == "contains" => {
                        filters.title = Some(TitleMatch::Substring(text));
                    }
                    Tok::Ident(w) if w == "matches" => {
                        filters.title = Some(TitleMatch::Spec {
                            contains: None,
                            regex: Some(text),
                        });
                    }
                    Tok::OpEq => filters.title = Some(TitleMatch::Substring(text)),
                    other => {
                        return Err(ExprError::new(
                            pos,
                            format!("title supports 'contains', 'matches', or '==', found {other}"),
                        ));
                    }
                }
            }
            other => {
                return Err(ExprError::new(pos, format!("unknown filter {other:?}")));
            }
        }
        Ok(())
    }

    fn parse_string_criterion(&mut self, key: &str) -> Result<StringOrList> {
        match self.next() {
            (Tok::OpEq, _) => {
                let pos = self.pos();
                match self.parse_literal()? {
                    Lit::Str(s) => Ok(StringOrList::One(s)),
                    other => Err(ExprError::new(
                        pos,
                        format!("{key} expects a name, found {other:?}"),
                    )),
                }
            }
            (Tok::KwIn, _) => {
                let pos = self.pos();
                match self.parse_literal()? {
                    Lit::List(items) => {
                        let mut names = Vec::with_capacity(items.len());
                        for item in items {
                            let Lit::Str(s) = item else {
                                return Err(ExprError::new(pos, format!("{key} list expects names")));
                            };
                            names.push(s);
                        }
                        Ok(StringOrList::Many(names))
                    }
                    _ => Err(ExprError::new(pos, format!("{key} in expects a list"))),
                }
            }
            (other, pos) => Err(ExprError::new(
                pos,
                format!("{key} supports '==' or 'in', found {other}"),
            )),
        }
    }

    fn parse_int_criterion(&mut self, key: &str) -> Result<IntOrCompare> {
        let (op_tok, op_pos) = self.next();
        let value_pos = self.pos();
        let value = match self.parse_literal()? {
            Lit::Number(n) if n.fract() == 0.0 => n as i64,
            _ => return Err(ExprError::new(value_pos, format!("{key} expects an integer"))),
        };
        let result = match op_tok {
            Tok::OpEq => IntOrCompare::Exact(value),
            Tok::OpNeq => IntOrCompare::Compare(Comparison { op: CompareOp::Neq, value }),
            Tok::OpLt => IntOrCompare::Compare(Comparison { op: CompareOp::Lt, value }),
            Tok::OpLte => IntOrCompare::Compare(Comparison { op: CompareOp::Lte, value }),
            Tok::OpGt => IntOrCompare::Compare(Comparison { op: CompareOp::Gt, value }),
            Tok::OpGte => IntOrCompare::Compare(Comparison { op: CompareOp::Gte, value }),
            other => {
                return Err(ExprError::new(
                    op_pos,
                    format!("{key} expects a comparison operator, found {other}"),
                ));
            }
        };
        Ok(result)
    }

    /// `is_original` / `is_dubbed`, optionally `(language [, min_confidence])`.
    fn parse_classification(&mut self, original: bool) -> Result<Condition> {
        let mut spec = ClassificationSpec::default();
        if matches!(self.peek(), Tok::LParen) {
            self.next();
            if !matches!(self.peek(), Tok::RParen) {
                let pos = self.pos();
                match self.parse_literal_or_name()? {
                    Lit::Str(lang) => spec.language = Some(lang),
                    Lit::Number(conf) => spec.min_confidence = conf,
                    other => {
                        return Err(ExprError::new(
                            pos,
                            format!("expected language or confidence, found {other:?}"),
                        ));
                    }
                }
                if matches!(self.peek(), Tok::Comma) {
                    self.next();
                    let pos = self.pos();
                    match self.parse_literal()? {
                        Lit::Number(conf) => spec.min_confidence = conf,
                        _ => {
                            return Err(ExprError::new(pos, "expected a confidence number"));
                        }
                    }
                }
            }
            self.expect(&Tok::RParen)?;
        }
        let payload = BoolOrClassification::Spec(spec);
        Ok(if original {
            Condition::IsOriginal(payload)
        } else {
            Condition::IsDubbed(payload)
        })
    }

    /// `audio_is_multi_language`, optionally `(threshold [, language])`.
    fn parse_multi_language(&mut self) -> Result<Condition> {
        let mut threshold = 0.05;
        let mut primary_language = None;
        if matches!(self.peek(), Tok::LParen) {
            self.next();
            if !matches!(self.peek(), Tok::RParen) {
                let pos = self.pos();
                match self.parse_literal()? {
                    Lit::Number(t) => threshold = t,
                    _ => return Err(ExprError::new(pos, "expected a threshold number")),
                }
                if matches!(self.peek(), Tok::Comma) {
                    self.next();
                    primary_language = Some(self.parse_name("language")?);
                }
            }
            self.expect(&Tok::RParen)?;
        }
        Ok(Condition::AudioIsMultiLanguage {
            track_index: None,
            threshold,
            primary_language,
        })
    }

    /// A bare identifier or a quoted string, used where names are expected.
    fn parse_name(&mut self, what: &str) -> Result<String> {
        match self.next() {
            (Tok::Ident(name), _) => Ok(name),
            (Tok::Str(name), _) => Ok(name),
            (other, pos) => Err(ExprError::new(pos, format!("expected {what}, found {other}"))),
        }
    }

    fn parse_literal(&mut self) -> Result<Lit> {
        match self.next() {
            (Tok::Number(n), _) => Ok(Lit::Number(n)),
            (Tok::Size(n), _) => Ok(Lit::Size(n)),
            (Tok::Str(s), _) => Ok(Lit::Str(s)),
            (Tok::Bool(b), _) => Ok(Lit::Bool(b)),
            // Bare identifiers double as string literals (eng, hevc, dts-hd).
            (Tok::Ident(s), _) => Ok(Lit::Str(s)),
            (Tok::LBracket, _) => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Tok::RBracket) {
                    loop {
                        items.push(self.parse_literal()?);
                        if matches!(self.peek(), Tok::Comma) {
                            self.next();
                        } else {
                            break;
                        }
                    }
                }
                self.expect(&Tok::RBracket)?;
                Ok(Lit::List(items))
            }
            (other, pos) => Err(ExprError::new(pos, format!("expected a literal, found {other}"))),
        }
    }

    fn parse_literal_or_name(&mut self) -> Result<Lit> {
        self.parse_literal()
    }
}

/// Parse an expression string into a [`Condition`].
pub fn parse_expression(src: &str) -> Result<Condition> {
    let toks = Lexer::new(src).tokenize()?;
    let mut parser = Parser { toks, idx: 0 };
    let cond = parser.parse_or()?;
    if !matches!(parser.peek(), Tok::Eof) {
        return Err(ExprError::new(
            parser.pos(),
            format!("unexpected trailing {}", parser.peek()),
        ));
    }
    cond.validate()
        .map_err(|message| ExprError::new(0, message))?;
    Ok(cond)
}

fn validate_expr_operand(op: &CompareOp, value: &Value, pos: usize) -> Result<()> {
    if op.is_ordering() && !value.is_number() {
        return Err(ExprError::new(
            pos,
            format!("operator '{}' requires a numeric value", op.as_str()),
        ));
    }
    if matches!(op, CompareOp::Contains) && !value.is_string() {
        return Err(ExprError::new(pos, "'contains' requires a string value"));
    }
    Ok(())
}

// Precedence levels used when deciding whether to parenthesize.
const PREC_OR: u8 = 0;
const PREC_AND: u8 = 1;
const PREC_NOT: u8 = 2;

/// Render a condition as an expression string.
///
/// For every condition the parser can produce, `parse(unparse(c)) == c`.
/// Conditions only expressible in the structured YAML form (negated
/// classification shorthands, explicit track indices) render best-effort.
pub fn unparse(cond: &Condition) -> String {
    unparse_prec(cond, PREC_OR)
}

fn unparse_prec(cond: &Condition, min_prec: u8) -> String {
    let (text, prec) = match cond {
        Condition::Any(items) => (
            items
                .iter()
                .map(|c| unparse_prec(c, PREC_AND))
                .collect::<Vec<_>>()
                .join(" or "),
            PREC_OR,
        ),
        Condition::All(items) => (
            items
                .iter()
                .map(|c| unparse_prec(c, PREC_NOT))
                .collect::<Vec<_>>()
                .join(" and "),
            PREC_AND,
        ),
        Condition::Not(inner) => {
            (format!("not {}", unparse_prec(inner, PREC_NOT)), PREC_NOT)
        }
        leaf => (unparse_leaf(leaf), u8::MAX),
    };
    if prec < min_prec {
        format!("({text})")
    } else {
        text
    }
}

fn unparse_leaf(cond: &Condition) -> String {
    match cond {
        Condition::Exists { track_kind, filters } => {
            let mut parts = vec![track_kind.as_str().to_string()];
            parts.extend(unparse_filters(filters));
            format!("exists({})", parts.join(", "))
        }
        Condition::Count { track_kind, filters, op, value } => {
            let mut parts = vec![track_kind.as_str().to_string()];
            parts.extend(unparse_filters(filters));
            format!("count({}) {} {}", parts.join(", "), op_symbol(op), value)
        }
        Condition::PluginMetadata { plugin, field, op, value } => {
            let call = format!("plugin_metadata({plugin}, {field})");
            unparse_metadata(call, op, value.as_ref())
        }
        Condition::ContainerMetadata { field, op, value } => {
            let call = format!("container_metadata({field})");
            unparse_metadata(call, op, value.as_ref())
        }
        Condition::IsOriginal(payload) => unparse_classification("is_original", payload),
        Condition::IsDubbed(payload) => unparse_classification("is_dubbed", payload),
        Condition::AudioIsMultiLanguage { threshold, primary_language, .. } => {
            match (threshold, primary_language) {
                (t, None) if (*t - 0.05).abs() < f64::EPSILON => {
                    "audio_is_multi_language".to_string()
                }
                (t, None) => format!("audio_is_multi_language({t})"),
                (t, Some(lang)) => format!("audio_is_multi_language({t}, {lang})"),
            }
        }
        Condition::All(_) | Condition::Any(_) | Condition::Not(_) => {
            unreachable!("combinators handled in unparse_prec")
        }
    }
}

fn unparse_metadata(call: String, op: &CompareOp, value: Option<&Value>) -> String {
    match (op, value) {
        (CompareOp::Exists, _) | (_, None) => call,
        (op, Some(value)) => format!("{call} {} {}", op_symbol(op), unparse_value(value)),
    }
}

fn unparse_classification(name: &str, payload: &BoolOrClassification) -> String {
    let spec = payload.resolve();
    let default_conf = (spec.min_confidence - 0.7).abs() < f64::EPSILON;
    let base = match (&spec.language, default_conf) {
        (None, true) => name.to_string(),
        (Some(lang), true) => format!("{name}({lang})"),
        (Some(lang), false) => format!("{name}({lang}, {})", spec.min_confidence),
        (None, false) => format!("{name}({})", spec.min_confidence),
    };
    if spec.value {
        base
    } else {
        // Structured-form-only shape; closest expression rendering.
        format!("not {base}")
    }
}

fn unparse_filters(filters: &TrackSelector) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(language) = &filters.language {
        out.push(unparse_string_criterion("language", language));
    }
    if let Some(codec) = &filters.codec {
        out.push(unparse_string_criterion("codec", codec));
    }
    if let Some(default) = filters.is_default {
        out.push(if default {
            "is_default".to_string()
        } else {
            "is_default == false".to_string()
        });
    }
    if let Some(forced) = filters.is_forced {
        out.push(if forced {
            "is_forced".to_string()
        } else {
            "is_forced == false".to_string()
        });
    }
    if let Some(channels) = &filters.channels {
        out.push(unparse_int_criterion("channels", channels));
    }
    if let Some(width) = &filters.width {
        out.push(unparse_int_criterion("width", width));
    }
    if let Some(height) = &filters.height {
        out.push(unparse_int_criterion("height", height));
    }
    if let Some(title) = &filters.title {
        out.push(match title {
            TitleMatch::Substring(text) => format!("title contains \"{text}\""),
            TitleMatch::Spec { contains: Some(text), .. } => {
                format!("title contains \"{text}\"")
            }
            TitleMatch::Spec { regex: Some(re), .. } => format!("title matches \"{re}\""),
            TitleMatch::Spec { contains: None, regex: None } => String::new(),
        });
    }
    if let Some(nc) = filters.not_commentary {
        out.push(if nc {
            "not_commentary".to_string()
        } else {
            "not_commentary == false".to_string()
        });
    }
    out.retain(|s| !s.is_empty());
    out
}

fn unparse_string_criterion(key: &str, value: &StringOrList) -> String {
    match value {
        StringOrList::One(s) => format!("{key}=={}", bareword_or_quoted(s)),
        StringOrList::Many(items) => format!(
            "{key} in [{}]",
            items
                .iter()
                .map(|s| bareword_or_quoted(s))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn unparse_int_criterion(key: &str, value: &IntOrCompare) -> String {
    match value {
        IntOrCompare::Exact(n) => format!("{key}=={n}"),
        IntOrCompare::Compare(c) => format!("{key}{}{}", op_symbol(&c.op), c.value),
    }
}

fn op_symbol(op: &CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "==",
        CompareOp::Neq => "!=",
        CompareOp::Lt => "<",
        CompareOp::Lte => "<=",
        CompareOp::Gt => ">",
        CompareOp::Gte => ">=",
        CompareOp::Contains => "contains",
        CompareOp::Exists => "exists",
    }
}

fn unparse_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("\"{s}\""),
        other => other.to_string(),
    }
}

/// Barewords survive lexing as identifiers; anything else gets quoted.
fn bareword_or_quoted(s: &str) -> String {
    let is_bare = !s.is_empty()
        && s.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        && !matches!(s, "and" | "or" | "not" | "in" | "true" | "false");
    if is_bare {
        s.to_string()
    } else {
        format!("\"{s}\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(src: &str) -> Condition {
        let cond = parse_expression(src).unwrap();
        let rendered = unparse(&cond);
        let reparsed = parse_expression(&rendered)
            .unwrap_or_else(|e| panic!("reparse of {rendered:?} failed: {e}"));
        assert_eq!(reparsed, cond, "round trip drifted for {src:?} -> {rendered:?}");
        cond
    }

    #[test]
    fn parses_spec_example() {
        let cond = round_trip("exists(audio, language==eng) and count(audio, not_commentary)>=2");
        match cond {
            Condition::All(items) => {
                assert_eq!(items.len(), 2);
                match &items[0] {
                    Condition::Exists { track_kind, filters } => {
                        assert_eq!(*track_kind, TrackKind::Audio);
                        assert_eq!(
                            filters.language,
                            Some(StringOrList::One("eng".into()))
                        );
                    }
                    other => panic!("unexpected {other:?}"),
                }
                match &items[1] {
                    Condition::Count { op, value, filters, .. } => {
                        assert_eq!(*op, CompareOp::Gte);
                        assert_eq!(*value, 2);
                        assert_eq!(filters.not_commentary, Some(true));
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
            other => panic!("expected and-condition, got {other:?}"),
        }
    }

    #[test]
    fn precedence_or_lower_than_and() {
        let cond = round_trip("exists(video) or exists(audio) and exists(subtitle)");
        match cond {
            Condition::Any(items) => {
                assert!(matches!(items[0], Condition::Exists { .. }));
                assert!(matches!(items[1], Condition::All(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parens_override_precedence() {
        let cond = round_trip("(exists(video) or exists(audio)) and exists(subtitle)");
        match cond {
            Condition::All(items) => {
                assert!(matches!(items[0], Condition::Any(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn not_binds_tighter_than_and() {
        let cond = round_trip("not exists(audio, language==eng) and exists(subtitle, language==eng)");
        match cond {
            Condition::All(items) => {
                assert!(matches!(items[0], Condition::Not(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn hyphenated_barewords() {
        let cond = round_trip("exists(audio, codec==dts-hd)");
        match cond {
            Condition::Exists { filters, .. } => {
                assert_eq!(filters.codec, Some(StringOrList::One("dts-hd".into())));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn language_in_list() {
        let cond = round_trip("exists(audio, language in [eng, jpn, \"pt-br\"])");
        match cond {
            Condition::Exists { filters, .. } => {
                assert_eq!(
                    filters.language,
                    Some(StringOrList::Many(vec![
                        "eng".into(),
                        "jpn".into(),
                        "pt-br".into()
                    ]))
                );
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn numeric_filters_and_comparisons() {
        round_trip("exists(audio, channels>=6)");
        round_trip("exists(video, height>=1080, width<3840)");
        round_trip("count(subtitle, language==eng) < 3");
    }

    #[test]
    fn plugin_metadata_forms() {
        let exists = round_trip("plugin_metadata(radarr, original_language)");
        assert!(matches!(
            exists,
            Condition::PluginMetadata { op: CompareOp::Exists, value: None, .. }
        ));

        let eq = round_trip("plugin_metadata(radarr, original_language) == jpn");
        assert!(matches!(
            eq,
            Condition::PluginMetadata { op: CompareOp::Eq, value: Some(_), .. }
        ));

        round_trip("container_metadata(title) contains \"720p\"");
        round_trip("plugin_metadata(radarr, year) >= 2000");
    }

    #[test]
    fn size_literals_resolve_to_bytes() {
        let cond = parse_expression("plugin_metadata(radarr, size) > 15M").unwrap();
        match cond {
            Condition::PluginMetadata { value: Some(v), .. } => {
                assert_eq!(v, serde_json::json!(15 * 1024 * 1024));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classification_and_multilanguage() {
        round_trip("is_original");
        round_trip("is_dubbed(eng)");
        round_trip("is_original(jpn, 0.8)");
        round_trip("audio_is_multi_language");
        round_trip("audio_is_multi_language(0.1, eng)");
    }

    #[test]
    fn title_filters() {
        round_trip("exists(audio, title contains \"commentary\")");
        round_trip("exists(audio, title matches \"(?i)director\")");
    }

    #[test]
    fn in_on_metadata_expands_to_disjunction() {
        let cond = round_trip("plugin_metadata(radarr, original_language) in [jpn, kor]");
        assert!(matches!(cond, Condition::Any(ref items) if items.len() == 2));
    }

    #[test]
    fn keywords_are_case_sensitive() {
        // "AND" is an identifier, not a keyword, so this is a parse error.
        assert!(parse_expression("exists(video) AND exists(audio)").is_err());
    }

    #[test]
    fn identifiers_are_case_insensitive() {
        let a = parse_expression("EXISTS(Audio, Language==ENG)").unwrap();
        let b = parse_expression("exists(audio, language==eng)").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn errors_carry_positions() {
        let err = parse_expression("exists(audio,,)").unwrap_err();
        assert!(err.pos > 0);
        assert!(!err.message.is_empty());

        let err = parse_expression("exists(").unwrap_err();
        assert!(err.message.contains("track kind") || err.message.contains("end of input"));

        let err = parse_expression("count(audio)").unwrap_err();
        assert!(err.message.contains("comparison"));
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = parse_expression("exists(audio, title contains \"oops)").unwrap_err();
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn ordered_ops_require_numbers() {
        assert!(parse_expression("plugin_metadata(p, f) > jpn").is_err());
        assert!(parse_expression("plugin_metadata(p, f) > 5").is_ok());
    }

    #[test]
    fn trailing_tokens_rejected() {
        assert!(parse_expression("exists(audio) exists(video)").is_err());
    }

    #[test]
    fn bare_literal_is_not_a_condition() {
        assert!(parse_expression("42").is_err());
        assert!(parse_expression("eng").is_err());
    }
}
