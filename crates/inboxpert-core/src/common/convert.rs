//! Conversions between generated wire messages and domain records.

use crate::{
    proto::{categorization as cat, prediction as ml},
    types::{Alternative, BatchOutcome, CategoryResult, Email, ItemFailure, Prediction},
};

impl From<cat::Email> for Email {
    fn from(email: cat::Email) -> Self {
        Self {
            id: email.id,
            subject: email.subject,
            body: email.body,
            sender: email.sender,
            recipients: email.recipients,
            headers: email.headers,
        }
    }
}

impl From<Email> for cat::Email {
    fn from(email: Email) -> Self {
        Self {
            id: email.id,
            subject: email.subject,
            body: email.body,
            sender: email.sender,
            recipients: email.recipients,
            headers: email.headers,
        }
    }
}

impl From<&Email> for ml::EmailRequest {
    fn from(email: &Email) -> Self {
        Self {
            id: email.id.clone(),
            subject: email.subject.clone(),
            body: email.body.clone(),
            sender: email.sender.clone(),
            recipients: email.recipients.clone(),
            headers: email.headers.clone(),
        }
    }
}

impl From<ml::CategoryResponse> for Prediction {
    fn from(resp: ml::CategoryResponse) -> Self {
        Self {
            id: resp.id,
            category: resp.category,
            confidence: resp.confidence,
            keywords: resp.keywords,
            alternatives: resp
                .alternatives
                .into_iter()
                .map(|alt| Alternative {
                    category: alt.category,
                    confidence: alt.confidence,
                })
                .collect(),
        }
    }
}

impl From<Prediction> for ml::CategoryResponse {
    fn from(prediction: Prediction) -> Self {
        Self {
            id: prediction.id,
            category: prediction.category,
            confidence: prediction.confidence,
            keywords: prediction.keywords,
            alternatives: prediction
                .alternatives
                .into_iter()
                .map(|alt| ml::AlternativeCategory {
                    category: alt.category,
                    confidence: alt.confidence,
                })
                .collect(),
        }
    }
}

impl From<CategoryResult> for cat::CategoryResult {
    fn from(result: CategoryResult) -> Self {
        Self {
            id: result.email_id,
            categories: result.categories,
            confidence_score: result.confidence_score,
        }
    }
}

impl From<ItemFailure> for cat::ItemFailure {
    fn from(failure: ItemFailure) -> Self {
        Self {
            email_id: failure.email_id,
            error: failure.error.to_string(),
        }
    }
}

impl From<BatchOutcome> for cat::BatchCategorizeResponse {
    fn from(outcome: BatchOutcome) -> Self {
        let total_processed = i32::try_from(outcome.total()).unwrap_or(i32::MAX);
        let failed = i32::try_from(outcome.failures.len()).unwrap_or(i32::MAX);

        Self {
            results: outcome.results.into_iter().map(Into::into).collect(),
            failures: outcome.failures.into_iter().map(Into::into).collect(),
            total_processed,
            failed,
        }
    }
}
