use inboxpert_categorizer::server::{
    backend::Predictor,
    config::ServiceConfig,
    pool::{ConnectionPool, GrpcConnector},
    service::{CategorizationService, MemoryRepository},
};
use inboxpert_core::{
    proto::{
        categorization::{
            self as cat, BatchCategorizeRequest, CategorizeRequest,
            email_categorization_service_server::EmailCategorizationService,
        },
        prediction::{
            BatchCategoryResponse, BatchEmailRequest, CategoryResponse, EmailRequest,
            email_prediction_server::{EmailPrediction, EmailPredictionServer},
        },
    },
    types::{Alternative, Email, Prediction},
};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status, transport::Server};

/// Keyword model: invoices are `FINANCE`, everything else is `WORK`.
/// Subjects containing "poison" are rejected.
#[derive(Default)]
struct KeywordModel {
    calls: Arc<AtomicUsize>,
}

impl KeywordModel {
    fn label(email: EmailRequest) -> Result<CategoryResponse, Status> {
        if email.subject.contains("poison") {
            return Err(Status::invalid_argument("unparseable email"));
        }
        let (category, alternative) = if email.subject.to_lowercase().contains("invoice") {
            ("FINANCE", "SHOPPING")
        } else {
            ("WORK", "PERSONAL")
        };
        Ok(Prediction {
            id: email.id,
            category: category.into(),
            confidence: 0.9,
            keywords: vec![],
            alternatives: vec![Alternative {
                category: alternative.into(),
                confidence: 0.1,
            }],
        }
        .into())
    }
}

#[tonic::async_trait]
impl EmailPrediction for KeywordModel {
    async fn categorize_email(
        &self,
        req: Request<EmailRequest>,
    ) -> Result<Response<CategoryResponse>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Self::label(req.into_inner()).map(Response::new)
    }

    async fn batch_categorize_email(
        &self,
        req: Request<BatchEmailRequest>,
    ) -> Result<Response<BatchCategoryResponse>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let responses = req
            .into_inner()
            .emails
            .into_iter()
            .map(Self::label)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Response::new(BatchCategoryResponse { responses }))
    }
}

async fn spawn_backend() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let model = KeywordModel::default();
    let calls = Arc::clone(&model.calls);

    tokio::spawn(
        Server::builder()
            .add_service(EmailPredictionServer::new(model))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    (addr, calls)
}

fn service_for(addr: SocketAddr) -> CategorizationService<GrpcConnector> {
    let config = Arc::new(ServiceConfig {
        ml_server_addr: addr.to_string(),
        num_workers: 2,
        retry_attempts: 2,
        ..Default::default()
    });
    let pool = Arc::new(ConnectionPool::new(GrpcConnector::new(&config)));
    CategorizationService::new(config, pool)
}

fn email(id: &str, subject: &str) -> cat::Email {
    Email {
        id: id.into(),
        subject: subject.into(),
        body: "Details inside".into(),
        sender: "billing@example.com".into(),
        recipients: vec!["me@example.com".into()],
        ..Default::default()
    }
    .into()
}

#[tokio::test]
async fn categorizes_single_email_over_grpc() {
    let (addr, calls) = spawn_backend().await;
    let repository = Arc::new(MemoryRepository::new());
    let service = service_for(addr).with_repository(repository.clone());

    let result = service
        .categorize_email(Request::new(CategorizeRequest {
            email: Some(email("inv-1", "Your invoice for March")),
        }))
        .await
        .unwrap()
        .into_inner()
        .result
        .unwrap();

    assert_eq!(result.id, "inv-1");
    assert_eq!(result.categories, ["FINANCE", "SHOPPING"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(repository.categories().len(), 1);
}

#[tokio::test]
async fn batch_reports_rejected_items_next_to_results() {
    let (addr, calls) = spawn_backend().await;
    let service = service_for(addr);

    let emails = vec![
        email("1", "Invoice 42"),
        email("2", "poison pill"),
        email("3", "Sprint planning"),
        email("4", "Invoice 43"),
    ];
    let response = service
        .batch_categorize_emails(Request::new(BatchCategorizeRequest { emails }))
        .await
        .unwrap()
        .into_inner();

    let ids: Vec<_> = response.results.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, ["1", "3", "4"]);
    assert_eq!(response.results[1].categories[0], "WORK");

    assert_eq!(response.failures.len(), 1);
    assert_eq!(response.failures[0].email_id, "2");
    assert!(
        response.failures[0].error.contains("after 2 attempts"),
        "{}",
        response.failures[0].error
    );
    assert!(response.failures[0].error.contains("unparseable email"));
    assert_eq!(response.total_processed, 4);
    assert_eq!(response.failed, 1);

    // Rejections are not transport failures, so only the invoker retries.
    assert_eq!(calls.load(Ordering::SeqCst), 3 + 2);
}

#[tokio::test]
async fn pooled_handle_supports_backend_batching() {
    let (addr, calls) = spawn_backend().await;
    let service = service_for(addr);

    let connection = service
        .pool()
        .get_connection(&addr.to_string())
        .await
        .unwrap();
    let emails: Vec<Email> = [email("a", "Invoice"), email("b", "Lunch?")]
        .into_iter()
        .map(Email::from)
        .collect();

    let predictions = connection.batch_categorize(&emails).await.unwrap();

    let labels: Vec<_> = predictions.iter().map(|p| p.category.as_str()).collect();
    assert_eq!(labels, ["FINANCE", "WORK"]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_releases_the_pool() {
    let (addr, _) = spawn_backend().await;
    let service = service_for(addr);

    service
        .categorize_email(Request::new(CategorizeRequest {
            email: Some(email("1", "Standup")),
        }))
        .await
        .unwrap();
    assert_eq!(service.pool().len().await, 1);

    service.shutdown().await.unwrap();

    assert!(service.pool().is_empty().await);
    let status = service
        .categorize_email(Request::new(CategorizeRequest {
            email: Some(email("2", "Standup")),
        }))
        .await
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unavailable);
}
