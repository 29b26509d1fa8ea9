//! Persistence seam for categorized emails.
//!
//! The service writes through [`EmailRepository`] after a successful
//! categorization. Writes are best-effort: their outcome is reported as a
//! [`Persisted`] value and never turns a successful categorization into an
//! error.

use chrono::{DateTime, Utc};
use inboxpert_core::{
    Error, Result,
    types::{CategoryResult, Email},
};
use parking_lot::RwLock;
use uuid::Uuid;

/// A stored categorization, one per successful call.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryRecord {
    pub id: Uuid,
    pub email_id: String,
    pub categories: Vec<String>,
    pub confidence_score: f32,
    pub created_at: DateTime<Utc>,
}

impl CategoryRecord {
    pub fn new(result: &CategoryResult) -> Self {
        Self {
            id: Uuid::new_v4(),
            email_id: result.email_id.clone(),
            categories: result.categories.clone(),
            confidence_score: result.confidence_score,
            created_at: Utc::now(),
        }
    }
}

/// Storage for emails and their categorizations.
#[tonic::async_trait]
pub trait EmailRepository: Send + Sync + 'static {
    async fn save_email(&self, email: &Email) -> Result<()>;

    async fn save_category(&self, record: &CategoryRecord) -> Result<()>;

    async fn get_emails(&self) -> Result<Vec<Email>>;
}

/// Outcome of the best-effort persistence step.
#[derive(Debug, Clone)]
pub enum Persisted {
    /// Email and category record were written.
    Saved,
    /// No repository is configured.
    Skipped,
    /// A write failed. The categorization itself still stands.
    Failed(Error),
}

impl Persisted {
    pub const fn is_saved(&self) -> bool {
        matches!(self, Self::Saved)
    }
}

/// In-process repository. Email ids are unique, like the primary key of the
/// relational store it stands in for.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    emails: RwLock<Vec<Email>>,
    categories: RwLock<Vec<CategoryRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored category record, oldest first.
    pub fn categories(&self) -> Vec<CategoryRecord> {
        self.categories.read().clone()
    }
}

#[tonic::async_trait]
impl EmailRepository for MemoryRepository {
    async fn save_email(&self, email: &Email) -> Result<()> {
        let mut emails = self.emails.write();
        if emails.iter().any(|e| e.id == email.id) {
            return Err(Error::Persistence {
                reason: format!("email {} already exists", email.id),
            });
        }
        emails.push(email.clone());
        Ok(())
    }

    async fn save_category(&self, record: &CategoryRecord) -> Result<()> {
        self.categories.write().push(record.clone());
        Ok(())
    }

    async fn get_emails(&self) -> Result<Vec<Email>> {
        Ok(self.emails.read().clone())
    }
}
