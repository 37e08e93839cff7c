use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Expression {
    key: String,
    operator: Operator,
    #[serde(default)]
    values: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
    #[serde(other)]
    Unknown,
}

/// Selects a set of resources by label.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

/// A selector that cannot be expressed as a set of exact label pairs.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("operator {0:?} without a single value cannot be converted into a label map")]
    NotSingleValued(Operator),

    #[error("operator {0:?} cannot be converted into a label map")]
    Unsupported(Operator),
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    /// Reduces the selector to the exact key/value pairs it requires.
    ///
    /// `matchLabels` are taken as-is. An `In` expression with exactly one value contributes that
    /// pair (overriding a `matchLabels` entry for the same key); every other expression cannot be
    /// represented and fails the conversion.
    pub fn as_map(&self) -> Result<Map, SelectorError> {
        let mut map = self.match_labels.clone().unwrap_or_default();
        for expr in self.match_expressions.iter().flatten() {
            match expr.operator {
                Operator::In => {
                    let mut values = expr.values.iter();
                    match (values.next(), values.next()) {
                        (Some(v), None) => {
                            map.insert(expr.key.clone(), v.clone());
                        }
                        _ => return Err(SelectorError::NotSingleValued(Operator::In)),
                    }
                }
                ref op => return Err(SelectorError::Unsupported(op.clone())),
            }
        }
        Ok(map)
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === Expression ===

impl Expression {
    pub fn new(
        key: impl ToString,
        operator: Operator,
        values: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        Self {
            key: key.to_string(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}
