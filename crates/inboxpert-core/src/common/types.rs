//! # Domain records
//!
//! Transport independent records passed between the service layer, the
//! dispatcher and the ML backend. Wire messages are converted into these
//! types at the edges (see [`convert`](crate::convert)) so that the engine
//! never depends on generated code.
//!
//! ## Lifecycle
//!
//! Every record here is request scoped: it is created for one call and
//! dropped once the response has been sent. Persistence collaborators copy
//! what they need out of them.

use crate::Error;
use std::collections::HashMap;

/// An email submitted for categorization.
///
/// Immutable once a request has been built; the dispatcher takes ownership
/// of each item for the duration of its task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Email {
    pub id: String,
    pub subject: String,
    pub body: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub headers: HashMap<String, String>,
}

/// A secondary label proposed by the ML backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Alternative {
    pub category: String,
    pub confidence: f32,
}

/// The raw answer of the ML backend for one email.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prediction {
    pub id: String,
    pub category: String,
    pub confidence: f32,
    pub keywords: Vec<String>,
    pub alternatives: Vec<Alternative>,
}

/// Categorization produced exactly once per successfully processed email.
///
/// `confidence_score` is expected in `0.0..=1.0` but is passed through as
/// reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryResult {
    pub email_id: String,
    pub categories: Vec<String>,
    pub confidence_score: f32,
}

impl CategoryResult {
    /// Builds the result for `email_id` from a backend prediction.
    ///
    /// The primary label comes first, followed by the alternatives in the
    /// order the backend returned them. The result is always attributed to
    /// the submitted email, whatever id the backend echoes back.
    pub fn from_prediction(email_id: impl Into<String>, prediction: Prediction) -> Self {
        let mut categories = Vec::with_capacity(1 + prediction.alternatives.len());
        categories.push(prediction.category);
        categories.extend(prediction.alternatives.into_iter().map(|alt| alt.category));

        Self {
            email_id: email_id.into(),
            categories,
            confidence_score: prediction.confidence,
        }
    }
}

/// A batch item that could not be categorized.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub email_id: String,
    pub error: Error,
}

/// Combined outcome of a batch call.
///
/// Once a batch returns, `results.len() + failures.len()` equals the number
/// of submitted items. Both collections follow input order.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub results: Vec<CategoryResult>,
    pub failures: Vec<ItemFailure>,
}

impl BatchOutcome {
    /// Total number of items accounted for.
    pub fn total(&self) -> usize {
        self.results.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}
