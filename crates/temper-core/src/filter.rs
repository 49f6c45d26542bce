//! Session predicates.
//!
//! A [`Filter`] is a shareable `Fn(&Session) -> bool`. Context composition
//! never inspects a filter, it only wraps existing filters in boolean
//! combinators, so every derived filter stays a boolean combination of its
//! ancestors.

use std::fmt;
use std::sync::Arc;

use crate::session::Session;

/// Shared session predicate.
#[derive(Clone)]
pub struct Filter(Arc<dyn Fn(&Session) -> bool + Send + Sync>);

impl Filter {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&Session) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(predicate))
    }

    /// Matches every session.
    pub fn any() -> Self {
        Self::new(|_| true)
    }

    /// Matches no session.
    pub fn never() -> Self {
        Self::new(|_| false)
    }

    pub fn matches(&self, session: &Session) -> bool {
        (self.0)(session)
    }

    pub fn and(&self, other: &Filter) -> Filter {
        let (lhs, rhs) = (self.clone(), other.clone());
        Filter::new(move |session| lhs.matches(session) && rhs.matches(session))
    }

    pub fn or(&self, other: &Filter) -> Filter {
        let (lhs, rhs) = (self.clone(), other.clone());
        Filter::new(move |session| lhs.matches(session) || rhs.matches(session))
    }

    pub fn and_not(&self, other: &Filter) -> Filter {
        let (lhs, rhs) = (self.clone(), other.clone());
        Filter::new(move |session| lhs.matches(session) && !rhs.matches(session))
    }

    /// Builds a predicate over one optional session field.
    ///
    /// An empty `values` list matches any session where the field is set.
    pub(crate) fn field<F>(values: &[&str], field: F) -> Filter
    where
        F: Fn(&Session) -> Option<&str> + Send + Sync + 'static,
    {
        let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        Filter::new(move |session| match field(session) {
            Some(value) => values.is_empty() || values.iter().any(|v| v == value),
            None => false,
        })
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Filter(..)")
    }
}
