//! Declarative queries: filters, ordering and paging.
//!
//! A query is turned into a canonical subscription hash so that logically
//! identical subscriptions share one server subscription:
//! ```text
//! tasks#and(done-e-false|owner-e-"ana")#o-createdAt-d#t50
//! ──┬── ──────────────┬───────────────  ──────┬──────  ─┬─
//! collection   filter (operands sorted)    ordering   paging
//! ```
//!
//! The same query is also evaluated locally, so incremental updates can be
//! applied to a cached result set without asking the server again.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{DocumentSnapshot, CREATED_KEY, ID_KEY, MODIFIED_KEY};
use crate::error::{RapidError, Result};

/// Largest page a subscription or fetch may request.
pub const TAKE_LIMIT: usize = 500;

/// Relation between a document field and a reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Relation {
    Equal,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    StartsWith,
    EndsWith,
    ArrayContains,
}

impl Relation {
    fn hash_tag(self) -> &'static str {
        match self {
            Self::Equal => "e",
            Self::GreaterThan => "gt",
            Self::GreaterThanOrEqual => "gte",
            Self::LessThan => "lt",
            Self::LessThanOrEqual => "lte",
            Self::Contains => "cnt",
            Self::StartsWith => "pref",
            Self::EndsWith => "suf",
            Self::ArrayContains => "arr-cnt",
        }
    }

    fn requires_string(self) -> bool {
        matches!(self, Self::Contains | Self::StartsWith | Self::EndsWith)
    }
}

/// Subscription filter: a simple predicate or a logical combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    Simple {
        key_path: String,
        relation: Relation,
        /// `null` compares against a missing or null field
        value: Value,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn simple(key_path: impl Into<String>, relation: Relation, value: impl Into<Value>) -> Self {
        Self::Simple {
            key_path: key_path.into(),
            relation,
            value: value.into(),
        }
    }

    pub fn equal(key_path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::simple(key_path, Relation::Equal, value)
    }

    pub fn is_null(key_path: impl Into<String>) -> Self {
        Self::simple(key_path, Relation::Equal, Value::Null)
    }

    pub fn greater_than(key_path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::simple(key_path, Relation::GreaterThan, value)
    }

    pub fn greater_than_or_equal(key_path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::simple(key_path, Relation::GreaterThanOrEqual, value)
    }

    pub fn less_than(key_path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::simple(key_path, Relation::LessThan, value)
    }

    pub fn less_than_or_equal(key_path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::simple(key_path, Relation::LessThanOrEqual, value)
    }

    pub fn contains(key_path: impl Into<String>, value: impl Into<String>) -> Self {
        Self::simple(key_path, Relation::Contains, value.into())
    }

    pub fn starts_with(key_path: impl Into<String>, value: impl Into<String>) -> Self {
        Self::simple(key_path, Relation::StartsWith, value.into())
    }

    pub fn ends_with(key_path: impl Into<String>, value: impl Into<String>) -> Self {
        Self::simple(key_path, Relation::EndsWith, value.into())
    }

    pub fn array_contains(key_path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::simple(key_path, Relation::ArrayContains, value)
    }

    pub fn and(operands: Vec<Filter>) -> Self {
        Self::And(operands)
    }

    pub fn or(operands: Vec<Filter>) -> Self {
        Self::Or(operands)
    }

    pub fn not(operand: Filter) -> Self {
        Self::Not(Box::new(operand))
    }

    /// Canonical text form shared by logically identical filters.
    ///
    /// Nested AND/OR operands of the same kind are flattened, then sorted and
    /// deduplicated; a compound left with one operand collapses to it.
    pub fn canonical(&self) -> String {
        match self {
            Self::Simple { key_path, relation, value } => {
                format!("{key_path}-{}-{}", relation.hash_tag(), canonical_value(value))
            }
            Self::And(operands) => Self::canonical_compound("and", operands, true),
            Self::Or(operands) => Self::canonical_compound("or", operands, false),
            Self::Not(operand) => format!("not({})", operand.canonical()),
        }
    }

    fn canonical_compound(tag: &str, operands: &[Filter], conjunction: bool) -> String {
        let mut hashes = Vec::new();
        Self::collect_operands(operands, conjunction, &mut hashes);
        hashes.sort_unstable();
        hashes.dedup();
        match hashes.as_slice() {
            [only] => only.clone(),
            _ => format!("{tag}({})", hashes.join("|")),
        }
    }

    fn collect_operands(operands: &[Filter], conjunction: bool, hashes: &mut Vec<String>) {
        for operand in operands {
            match (operand, conjunction) {
                (Self::And(inner), true) | (Self::Or(inner), false) => {
                    Self::collect_operands(inner, conjunction, hashes)
                }
                _ => hashes.push(operand.canonical()),
            }
        }
    }

    /// Reject filters the server would refuse.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Simple { key_path, relation, value } => {
                validate_key_path(key_path)?;
                if relation.requires_string() && !value.is_string() {
                    return Err(RapidError::InvalidQuery(format!(
                        "relation {relation:?} on '{key_path}' needs a string value"
                    )));
                }
                if *relation != Relation::Equal && value.is_null() {
                    return Err(RapidError::InvalidQuery(format!(
                        "relation {relation:?} on '{key_path}' cannot compare with null"
                    )));
                }
                if key_path == ID_KEY && !(value.is_string() || value.is_null()) {
                    return Err(RapidError::InvalidQuery(
                        "document ids can only be compared with strings".into(),
                    ));
                }
                Ok(())
            }
            Self::And(operands) | Self::Or(operands) => {
                if operands.is_empty() {
                    return Err(RapidError::InvalidQuery("compound filter without operands".into()));
                }
                operands.iter().try_for_each(Filter::validate)
            }
            Self::Not(operand) => operand.validate(),
        }
    }

    /// Evaluate against a document.
    pub fn matches(&self, doc: &DocumentSnapshot) -> bool {
        match self {
            Self::Simple { key_path, relation, value } => {
                let field = doc.field(key_path);
                evaluate(field.as_deref(), *relation, value)
            }
            Self::And(operands) => operands.iter().all(|f| f.matches(doc)),
            Self::Or(operands) => operands.iter().any(|f| f.matches(doc)),
            Self::Not(operand) => !operand.matches(doc),
        }
    }
}

/// Text form of a filter value; integral floats print as integers so that
/// `5` and `5.0` hash alike, as they compare equal.
fn canonical_value(value: &Value) -> String {
    match value {
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (None, Some(u), _) => u.to_string(),
            (None, None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_value).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(fields) => {
            let mut fields: Vec<String> = fields
                .iter()
                .map(|(k, v)| format!("{k:?}:{}", canonical_value(v)))
                .collect();
            fields.sort_unstable();
            format!("{{{}}}", fields.join(","))
        }
        other => other.to_string(),
    }
}

fn evaluate(field: Option<&Value>, relation: Relation, reference: &Value) -> bool {
    match relation {
        Relation::Equal => match field {
            None | Some(Value::Null) => reference.is_null(),
            Some(actual) => compare_values(actual, reference) == Some(Ordering::Equal),
        },
        Relation::GreaterThan => cmp_field(field, reference).is_some_and(Ordering::is_gt),
        Relation::GreaterThanOrEqual => cmp_field(field, reference).is_some_and(Ordering::is_ge),
        Relation::LessThan => cmp_field(field, reference).is_some_and(Ordering::is_lt),
        Relation::LessThanOrEqual => cmp_field(field, reference).is_some_and(Ordering::is_le),
        Relation::Contains => str_pair(field, reference).is_some_and(|(a, b)| a.contains(b)),
        Relation::StartsWith => str_pair(field, reference).is_some_and(|(a, b)| a.starts_with(b)),
        Relation::EndsWith => str_pair(field, reference).is_some_and(|(a, b)| a.ends_with(b)),
        Relation::ArrayContains => match field {
            Some(Value::Array(items)) => items
                .iter()
                .any(|item| compare_values(item, reference) == Some(Ordering::Equal)),
            _ => false,
        },
    }
}

fn cmp_field(field: Option<&Value>, reference: &Value) -> Option<Ordering> {
    compare_values(field?, reference)
}

fn str_pair<'a>(field: Option<&'a Value>, reference: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((field?.as_str()?, reference.as_str()?))
}

/// Compare two values of the same JSON type; `None` for mismatched types.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            (a == b).then_some(Ordering::Equal)
        }
        _ => None,
    }
}

/// Total order used for sorting: null < bool < number < string < array < object.
fn sort_order(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }
    match (a, b) {
        (Some(x), Some(y)) => match compare_values(x, y) {
            Some(ordering) => ordering,
            None => rank(a).cmp(&rank(b)).then_with(|| x.to_string().cmp(&y.to_string())),
        },
        _ => rank(a).cmp(&rank(b)),
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Validate a collection name or document id.
pub fn validate_identifier(value: &str) -> Result<()> {
    if is_identifier(value) {
        Ok(())
    } else {
        Err(RapidError::InvalidQuery(format!("invalid identifier '{value}'")))
    }
}

/// Validate a dotted key path or special key.
pub fn validate_key_path(key_path: &str) -> Result<()> {
    if [ID_KEY, CREATED_KEY, MODIFIED_KEY].contains(&key_path) {
        return Ok(());
    }
    let valid = !key_path.is_empty()
        && key_path
            .split('.')
            .all(|segment| !segment.is_empty() && !segment.starts_with('$'));
    if valid {
        Ok(())
    } else {
        Err(RapidError::InvalidQuery(format!("invalid key path '{key_path}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// One ordering criterion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub key_path: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(key_path: impl Into<String>, direction: Direction) -> Self {
        Self {
            key_path: key_path.into(),
            direction,
        }
    }

    fn canonical(&self) -> String {
        let tag = match self.direction {
            Direction::Asc => "a",
            Direction::Desc => "d",
        };
        format!("o-{}-{tag}", self.key_path)
    }
}

/// Collection query: filter, ordering, paging.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    /// Add a filter; successive filters are combined with AND.
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(match (self.filter.take(), filter) {
            (None, filter) => filter,
            (Some(Filter::And(mut operands)), Filter::And(more)) => {
                operands.extend(more);
                Filter::And(operands)
            }
            (Some(Filter::And(mut operands)), filter) => {
                operands.push(filter);
                Filter::And(operands)
            }
            (Some(existing), Filter::And(mut more)) => {
                more.insert(0, existing);
                Filter::And(more)
            }
            (Some(existing), filter) => Filter::And(vec![existing, filter]),
        });
        self
    }

    pub fn order_by(mut self, key_path: impl Into<String>, direction: Direction) -> Self {
        self.order.push(OrderBy::new(key_path, direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.collection)?;
        if let Some(filter) = &self.filter {
            filter.validate()?;
        }
        for order in &self.order {
            validate_key_path(&order.key_path)?;
        }
        if let Some(limit) = self.limit {
            if limit == 0 || limit > TAKE_LIMIT {
                return Err(RapidError::InvalidQuery(format!(
                    "limit must be between 1 and {TAKE_LIMIT}, got {limit}"
                )));
            }
        }
        Ok(())
    }

    /// Canonical hash shared by logically identical subscriptions.
    pub fn subscription_hash(&self) -> String {
        let filter = self.filter.as_ref().map_or_else(|| "*".to_string(), Filter::canonical);
        let order: Vec<String> = self.order.iter().map(OrderBy::canonical).collect();
        let mut paging = String::new();
        if let Some(limit) = self.limit {
            paging.push_str(&format!("t{limit}"));
        }
        if let Some(skip) = self.skip {
            paging.push_str(&format!("s{skip}"));
        }
        format!("{}#{filter}#{}#{paging}", self.collection, order.join("|"))
    }

    pub fn matches(&self, doc: &DocumentSnapshot) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(doc))
    }

    /// Order two documents by the ordering list, ties broken by id ascending.
    pub fn compare(&self, a: &DocumentSnapshot, b: &DocumentSnapshot) -> Ordering {
        for order in &self.order {
            let left = a.field(&order.key_path);
            let right = b.field(&order.key_path);
            let ordering = sort_order(left.as_deref(), right.as_deref());
            let ordering = match order.direction {
                Direction::Asc => ordering,
                Direction::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        a.id.cmp(&b.id)
    }

    /// Sort and truncate to the limit. `skip` is applied by the server.
    pub fn arrange(&self, docs: &mut Vec<DocumentSnapshot>) {
        docs.sort_by(|a, b| self.compare(a, b));
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
    }

    /// Full server-side evaluation: filter, sort, skip, limit.
    pub fn evaluate<'a, I>(&self, docs: I) -> Vec<DocumentSnapshot>
    where
        I: IntoIterator<Item = &'a DocumentSnapshot>,
    {
        let mut matching: Vec<DocumentSnapshot> =
            docs.into_iter().filter(|d| self.matches(d)).cloned().collect();
        matching.sort_by(|a, b| self.compare(a, b));
        let skip = self.skip.unwrap_or(0);
        let take = self.limit.unwrap_or(usize::MAX);
        matching.into_iter().skip(skip).take(take).collect()
    }
}
