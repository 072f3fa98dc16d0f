use std::fmt;

use schema::{
    Column, DISPLAY_CAP, DecisionFilterStyle, Field, FilterRequest, Intent, KeyFilterStyle,
    LANGUAGE_WILDCARD, Row, ShapeLayout, Side, UserDecision,
};
use tracing::warn;

// ---------------------------------------------------------------------------
// Predicate tree
// ---------------------------------------------------------------------------

/// Immutable filter expression over the fields of a (possibly joined) row.
///
/// `And(vec![])` is the identity; `Or(vec![])` matches nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    True,
    Eq { field: Field, value: String },
    In { field: Field, values: Vec<String> },
    Contains { field: Field, needle: String },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

/// Anything a predicate can read field values from.
pub trait FieldSource {
    fn value(&self, field: Field) -> Option<&str>;
}

impl FieldSource for Row {
    fn value(&self, field: Field) -> Option<&str> {
        match field.side {
            Side::Base => self.get(field.column),
            Side::Log => None,
        }
    }
}

/// A base row paired with one matching log row.
#[derive(Debug, Clone, Copy)]
pub struct JoinedRow<'a> {
    pub base: &'a Row,
    pub log: &'a Row,
}

impl FieldSource for JoinedRow<'_> {
    fn value(&self, field: Field) -> Option<&str> {
        match field.side {
            Side::Base => self.base.get(field.column),
            Side::Log => self.log.get(field.column),
        }
    }
}

impl Predicate {
    pub fn nothing() -> Self {
        Self::Or(Vec::new())
    }

    /// Conjunction that drops identities and unwraps single terms.
    pub fn all(parts: Vec<Predicate>) -> Self {
        let mut parts: Vec<Predicate> = parts
            .into_iter()
            .filter(|part| !part.is_identity())
            .collect();
        match parts.len() {
            0 => Self::True,
            1 => parts.remove(0),
            _ => Self::And(parts),
        }
    }

    /// Disjunction that unwraps single terms. No terms means no match.
    pub fn any(mut parts: Vec<Predicate>) -> Self {
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Self::Or(parts)
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        let mut parts = match self {
            Self::And(parts) => parts,
            other_self => vec![other_self],
        };
        parts.push(other);
        Self::all(parts)
    }

    pub fn is_identity(&self) -> bool {
        match self {
            Self::True => true,
            Self::And(parts) => parts.iter().all(Predicate::is_identity),
            _ => false,
        }
    }

    pub fn matches_nothing(&self) -> bool {
        match self {
            Self::Or(parts) => parts.iter().all(Predicate::matches_nothing),
            Self::In { values, .. } => values.is_empty(),
            Self::And(parts) => parts.iter().any(Predicate::matches_nothing),
            _ => false,
        }
    }

    pub fn matches<S: FieldSource + ?Sized>(&self, source: &S) -> bool {
        match self {
            Self::True => true,
            Self::Eq { field, value } => source.value(*field) == Some(value.as_str()),
            Self::In { field, values } => source
                .value(*field)
                .is_some_and(|actual| values.iter().any(|value| value == actual)),
            Self::Contains { field, needle } => source
                .value(*field)
                .is_some_and(|actual| actual.contains(needle.as_str())),
            Self::And(parts) => parts.iter().all(|part| part.matches(source)),
            Self::Or(parts) => parts.iter().any(|part| part.matches(source)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field_name(field: &Field) -> String {
            let side = match field.side {
                Side::Base => "base",
                Side::Log => "log",
            };
            format!("{side}.{}", field.column.name())
        }

        fn join(f: &mut fmt::Formatter<'_>, parts: &[Predicate], op: &str) -> fmt::Result {
            f.write_str("(")?;
            for (idx, part) in parts.iter().enumerate() {
                if idx > 0 {
                    write!(f, " {op} ")?;
                }
                write!(f, "{part}")?;
            }
            f.write_str(")")
        }

        match self {
            Self::True => f.write_str("true"),
            Self::Eq { field, value } => write!(f, "{} = {value:?}", field_name(field)),
            Self::In { field, values } => write!(f, "{} in {values:?}", field_name(field)),
            Self::Contains { field, needle } => {
                write!(f, "{} contains {needle:?}", field_name(field))
            }
            Self::And(parts) if parts.is_empty() => f.write_str("true"),
            Self::Or(parts) if parts.is_empty() => f.write_str("false"),
            Self::And(parts) => join(f, parts, "and"),
            Self::Or(parts) => join(f, parts, "or"),
        }
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Builds the base-table predicate for a request: key list and language groups.
pub fn compile(req: &FilterRequest, layout: &ShapeLayout) -> Predicate {
    let mut parts = Vec::new();
    let key_field = Field::base(layout.key_column);

    match layout.key_filter {
        KeyFilterStyle::ExactAny => {
            if let Some(tokens) = req.items.as_deref().and_then(split_csv) {
                parts.push(any_of(key_field, tokens));
            }
        }
        KeyFilterStyle::SubstringLists => {
            if let Some(tokens) = req.entities_and.as_deref().and_then(split_csv) {
                parts.push(if tokens.is_empty() {
                    Predicate::nothing()
                } else {
                    contains_group(key_field, tokens, Combine::All)
                });
            }
            if let Some(tokens) = req.entities_or.as_deref().and_then(split_csv) {
                parts.push(contains_group(key_field, tokens, Combine::Any));
            }
        }
    }

    let language_field = Field::base(layout.language_column);
    if let Some(tokens) = language_tokens(req.languages_and.as_deref()) {
        parts.push(contains_group(language_field, tokens, Combine::All));
    }
    if let Some(tokens) = language_tokens(req.languages_or.as_deref()) {
        parts.push(contains_group(language_field, tokens, Combine::Any));
    }

    Predicate::all(parts)
}

/// Builds the log-table predicate used in reviewed mode: reviewer and decision filters.
pub fn compile_review_filters(req: &FilterRequest, layout: &ShapeLayout) -> Predicate {
    let mut parts = Vec::new();
    if let Some(users) = req.user_include.as_deref().and_then(split_csv) {
        parts.push(any_of(Field::log(Column::User), users));
    }
    if let Some(decision) = decision_filter(req.user_decision.as_ref(), layout.decision_filter) {
        parts.push(decision);
    }
    Predicate::all(parts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combine {
    All,
    Any,
}

fn contains_group(field: Field, tokens: Vec<String>, combine: Combine) -> Predicate {
    let terms = tokens
        .into_iter()
        .map(|needle| Predicate::Contains { field, needle })
        .collect();
    match combine {
        Combine::All => Predicate::all(terms),
        Combine::Any => Predicate::any(terms),
    }
}

fn any_of(field: Field, mut values: Vec<String>) -> Predicate {
    if values.len() == 1 {
        return Predicate::Eq {
            field,
            value: values.remove(0),
        };
    }
    Predicate::In { field, values }
}

fn decision_filter(
    decision: Option<&UserDecision>,
    style: DecisionFilterStyle,
) -> Option<Predicate> {
    let field = Field::log(Column::Decision);
    match (style, decision?) {
        (DecisionFilterStyle::Exact, UserDecision::One(value)) => {
            if value.is_empty() || value == "all" {
                None
            } else {
                Some(Predicate::Eq {
                    field,
                    value: value.clone(),
                })
            }
        }
        (DecisionFilterStyle::Exact, UserDecision::Many(values)) => {
            if values.is_empty() || values.iter().any(|value| value == "all") {
                return None;
            }
            warn!(
                decisions = values.len(),
                "userDecision list given to a single-decision dataset; matching nothing"
            );
            Some(Predicate::nothing())
        }
        (DecisionFilterStyle::AnyOf, UserDecision::One(value)) => {
            if value.is_empty() || value == "all" {
                None
            } else {
                Some(any_of(field, vec![value.clone()]))
            }
        }
        (DecisionFilterStyle::AnyOf, UserDecision::Many(values)) => {
            if values.is_empty() || values.iter().any(|value| value == "all") {
                None
            } else {
                Some(any_of(field, values.clone()))
            }
        }
    }
}

/// Splits a comma-separated list into trimmed, non-empty tokens.
///
/// Returns `None` for a blank input (dimension absent). A non-blank input
/// without usable tokens yields `Some(vec![])`, which compiles to no match.
fn split_csv(raw: &str) -> Option<Vec<String>> {
    if raw.trim().is_empty() {
        return None;
    }
    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

fn language_tokens(raw: Option<&[String]>) -> Option<Vec<String>> {
    let tokens: Vec<String> = raw?
        .iter()
        .map(|token| token.trim())
        .filter(|token| !token.is_empty() && *token != LANGUAGE_WILDCARD)
        .map(str::to_string)
        .collect();
    if tokens.is_empty() { None } else { Some(tokens) }
}

// ---------------------------------------------------------------------------
// Result windowing
// ---------------------------------------------------------------------------

/// Row limit a store fetch should use for the given intent.
pub fn fetch_limit(intent: Intent) -> Option<usize> {
    intent.is_display().then_some(DISPLAY_CAP)
}

/// Fetch limit for a path that will discard up to `discardable` rows afterwards.
pub fn over_fetch_limit(intent: Intent, discardable: usize) -> Option<usize> {
    fetch_limit(intent).map(|limit| limit.saturating_add(discardable))
}

pub fn cap<T>(mut rows: Vec<T>, limit: Option<usize>) -> Vec<T> {
    if let Some(limit) = limit {
        rows.truncate(limit);
    }
    rows
}

/// Applies the display cap when the intent asks for it; identity otherwise.
pub fn window<T>(rows: Vec<T>, intent: Intent) -> Vec<T> {
    cap(rows, fetch_limit(intent))
}
