use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

#[derive(Clone, Debug, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    key: String,
    operator: String,
    values: Option<BTreeSet<String>>,
}

/// Selects a set of labeled resources. The results of `match_labels` and
/// `match_expressions` are ANDed.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

// === Selector ===

impl Selector {
    fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    /// Indicates whether this selector matches all resources.
    pub fn selects_all(&self) -> bool {
        match (self.match_labels.as_ref(), self.match_expressions.as_ref()) {
            (None, None) => true,
            (Some(l), None) => l.is_empty(),
            (None, Some(e)) => e.is_empty(),
            (Some(l), Some(e)) => l.is_empty() && e.is_empty(),
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

impl From<LabelSelector> for Selector {
    fn from(sel: LabelSelector) -> Self {
        Self {
            match_labels: sel.match_labels,
            match_expressions: sel
                .match_expressions
                .map(|exprs| exprs.into_iter().map(Expression::from).collect()),
        }
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

// === Labels ===

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl std::cmp::PartialEq<Self> for Labels {
    #[inline]
    fn eq(&self, t: &Self) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::cmp::PartialEq<Option<Map>> for Labels {
    #[inline]
    fn eq(&self, t: &Option<Map>) -> bool {
        match t {
            None => self.0.is_empty(),
            Some(t) => t.eq(self.0.as_ref()),
        }
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match (self.operator.as_str(), self.values.as_ref()) {
            ("In", Some(values)) => match labels.get(&self.key) {
                Some(v) => values.contains(v),
                None => false,
            },
            ("NotIn", Some(values)) => match labels.get(&self.key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            ("Exists", None) => labels.contains_key(&self.key),
            ("DoesNotExist", None) => !labels.contains_key(&self.key),
            (operator, values) => {
                tracing::warn!(%operator, key = %self.key, ?values, "illegal match expression");
                false
            }
        }
    }
}

impl From<LabelSelectorRequirement> for Expression {
    fn from(req: LabelSelectorRequirement) -> Self {
        Self {
            key: req.key,
            operator: req.operator,
            values: req.values.map(|vs| vs.into_iter().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    fn expr(key: &str, operator: &str, values: Option<&[&str]>) -> Expression {
        Expression {
            key: key.to_string(),
            operator: operator.to_string(),
            values: values.map(|vs| vs.iter().map(|v| v.to_string()).collect()),
        }
    }

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "baz"))),
                false,
                "label mismatch",
            ),
            (
                Selector::from_iter(Some(expr("foo", "In", Some(&["bar"])))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "In expression match",
            ),
            (
                Selector::from_iter(Some(expr("foo", "NotIn", Some(&["quux"])))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "NotIn expression match",
            ),
            (
                Selector::from_iter(Some(expr("foo", "NotIn", Some(&["bar"])))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                false,
                "NotIn expression non-match",
            ),
            (
                Selector::from_iter(Some(expr("foo", "Exists", None))),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "Exists expression match",
            ),
            (
                Selector::from_iter(Some(expr("foo", "DoesNotExist", None))),
                Labels::from_iter(Some(("foo", "bar"))),
                false,
                "DoesNotExist expression non-match",
            ),
            (
                Selector::from_iter(Some(expr("foo", "Frobs", None))),
                Labels::from_iter(Some(("foo", "bar"))),
                false,
                "illegal operator never matches",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn empty_selector_selects_all() {
        assert!(Selector::default().selects_all());
        assert!(Selector::from(LabelSelector::default()).selects_all());
        assert!(!Selector::from_iter(Some(("foo", "bar"))).selects_all());
    }
}
