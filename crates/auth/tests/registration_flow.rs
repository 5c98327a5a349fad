//! End-to-end auth flows over the in-memory stack: bus → unit of work →
//! outbox → processor → event handler.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use gatekeeper_auth::repository::USERS_TABLE;
use gatekeeper_auth::user::{USER_CREATED, USER_LOGGED_IN, USER_PASSWORD_CHANGED};
use gatekeeper_auth::{
    AuthError, ChangePassword, Collaborators, FindUserByEmail, GetUser, InMemoryGatekeeper, Login,
    PasswordHash, PasswordHasher, RegisterUser,
};
use gatekeeper_core::{AggregateId, DomainError, DomainEvent, RequestContext};
use gatekeeper_events::{BusError, EventHandler};
use gatekeeper_infra::{GatekeeperConfig, OutboxRepository, OutboxStatus};
use gatekeeper_observability::{InMemoryMetrics, MetricKind, NoopTracer};

/// Reversible stand-in for a real hasher. Refuses the password "boom".
struct TestHasher;

impl PasswordHasher for TestHasher {
    fn hash(&self, password: &str) -> Result<PasswordHash, AuthError> {
        if password == "boom" {
            return Err(AuthError::Hashing("hasher unavailable".to_string()));
        }
        Ok(PasswordHash::new(format!("test${password}")))
    }

    fn verify(&self, password: &str, hash: &PasswordHash) -> bool {
        hash.as_str() == format!("test${password}")
    }
}

#[derive(Default)]
struct Audit {
    seen: Mutex<Vec<DomainEvent>>,
}

impl Audit {
    fn names(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|e| e.name().to_string()).collect()
    }
}

struct AuditHandler(Arc<Audit>);

#[async_trait]
impl EventHandler for AuditHandler {
    fn name(&self) -> &str {
        "audit"
    }

    fn can_handle(&self, event_name: &str) -> bool {
        event_name.starts_with("user.")
    }

    async fn handle(&self, _ctx: &RequestContext, event: &DomainEvent) -> anyhow::Result<()> {
        self.0.seen.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct Harness {
    app: InMemoryGatekeeper,
    audit: Arc<Audit>,
    metrics: Arc<InMemoryMetrics>,
}

fn harness() -> Harness {
    let metrics = Arc::new(InMemoryMetrics::new());
    let app = InMemoryGatekeeper::build(
        GatekeeperConfig::default(),
        Collaborators {
            hasher: Arc::new(TestHasher),
            tracer: Arc::new(NoopTracer),
            metrics: metrics.clone(),
        },
    )
    .unwrap();
    let audit = Arc::new(Audit::default());
    app.dispatcher.register_handler(AuditHandler(audit.clone()));
    Harness { app, audit, metrics }
}

fn register(email: &str, password: &str) -> RegisterUser {
    RegisterUser {
        email: email.to_string(),
        password: password.to_string(),
    }
}

fn auth_error(err: &BusError) -> &AuthError {
    err.downcast_ref::<AuthError>()
        .unwrap_or_else(|| panic!("expected an AuthError, got {err:?}"))
}

#[tokio::test]
async fn registration_is_staged_then_delivered_once() {
    let h = harness();
    let ctx = RequestContext::new();

    let user_id = h
        .app
        .commands
        .execute(&ctx, register("ada@example.com", "correct horse"))
        .await
        .unwrap();

    let pending = h.app.outbox.fetch_pending(&ctx, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_name, USER_CREATED);
    assert_eq!(pending[0].status, OutboxStatus::Pending);
    assert!(h.audit.names().is_empty());

    let report = h.app.processor.process(&ctx).await.unwrap();
    assert_eq!(report.sent, 1);
    assert_eq!(h.audit.names(), vec![USER_CREATED]);

    let row = h.app.outbox.get(&ctx, pending[0].id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Sent);

    assert_eq!(h.app.processor.process(&ctx).await.unwrap().fetched, 0);
    assert_eq!(h.audit.names().len(), 1);

    let delivered = h.audit.seen.lock().unwrap()[0].clone();
    assert_eq!(delivered.aggregate_id(), AggregateId::from(user_id));

    let view = h.app.queries.execute(&ctx, GetUser { user_id }).await.unwrap();
    assert_eq!(view.email.as_str(), "ada@example.com");
    assert_eq!(view.version, 1);

    assert_eq!(h.metrics.count(MetricKind::Command, "register_user", "success"), 1);
    assert_eq!(h.metrics.count(MetricKind::Outbox, USER_CREATED, "sent"), 1);
}

#[tokio::test]
async fn login_and_password_change_emit_events_in_order() {
    let h = harness();
    let ctx = RequestContext::new();
    let user_id = h
        .app
        .commands
        .execute(&ctx, register("ada@example.com", "first"))
        .await
        .unwrap();

    let login = h
        .app
        .commands
        .execute(
            &ctx,
            Login {
                email: "ADA@example.com".to_string(),
                password: "first".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(login.user_id, user_id);
    assert_eq!(login.email.as_str(), "ada@example.com");

    h.app
        .commands
        .execute(
            &ctx,
            ChangePassword {
                user_id,
                current_password: "first".to_string(),
                new_password: "second".to_string(),
            },
        )
        .await
        .unwrap();

    let err = h
        .app
        .commands
        .execute(
            &ctx,
            Login {
                email: "ada@example.com".to_string(),
                password: "first".to_string(),
            },
        )
        .await
        .unwrap_err();
    assert_eq!(auth_error(&err), &AuthError::InvalidCredentials);

    h.app
        .commands
        .execute(
            &ctx,
            Login {
                email: "ada@example.com".to_string(),
                password: "second".to_string(),
            },
        )
        .await
        .unwrap();

    h.app.processor.process(&ctx).await.unwrap();
    assert_eq!(
        h.audit.names(),
        vec![USER_CREATED, USER_LOGGED_IN, USER_PASSWORD_CHANGED, USER_LOGGED_IN]
    );

    let view = h
        .app
        .queries
        .execute(
            &ctx,
            FindUserByEmail {
                email: "ada@example.com".to_string(),
            },
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(view.version, 4);
    assert!(view.password_changed_at.is_some());
    assert!(view.last_login_at.is_some());
}

#[tokio::test]
async fn duplicate_email_leaves_no_trace() {
    let h = harness();
    let ctx = RequestContext::new();
    h.app
        .commands
        .execute(&ctx, register("ada@example.com", "one"))
        .await
        .unwrap();

    let err = h
        .app
        .commands
        .execute(&ctx, register(" Ada@Example.com", "two"))
        .await
        .unwrap_err();

    assert_eq!(
        auth_error(&err),
        &AuthError::EmailTaken("ada@example.com".to_string())
    );
    assert_eq!(h.app.database().len(USERS_TABLE), 1);
    assert_eq!(h.app.outbox.fetch_pending(&ctx, 10).await.unwrap().len(), 1);
    assert_eq!(h.metrics.count(MetricKind::Command, "register_user", "failure"), 1);
}

#[tokio::test]
async fn rejected_commands_write_nothing() {
    let h = harness();
    let ctx = RequestContext::new();

    let err = h.app.commands.execute(&ctx, register("", "")).await.unwrap_err();
    assert!(matches!(err, BusError::NilCommand { .. }));

    let err = h
        .app
        .commands
        .execute(&ctx, register("not-an-email", "pw"))
        .await
        .unwrap_err();
    assert!(matches!(auth_error(&err), AuthError::Domain(DomainError::Validation(_))));

    let err = h
        .app
        .commands
        .execute(&ctx, register("ada@example.com", "boom"))
        .await
        .unwrap_err();
    assert!(matches!(auth_error(&err), AuthError::Hashing(_)));

    let err = h
        .app
        .queries
        .execute(&ctx, GetUser { user_id: Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(auth_error(&err), AuthError::UserNotFound(_)));

    assert!(h.app.database().is_empty(USERS_TABLE));
    assert!(h.app.outbox.fetch_pending(&ctx, 10).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_all_commit() {
    let h = harness();
    let commands = h.app.commands.clone();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..50 {
        let commands = commands.clone();
        tasks.spawn(async move {
            commands
                .execute(&RequestContext::new(), register(&format!("user{i}@example.com"), "pw"))
                .await
        });
    }

    let mut ids = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        ids.push(joined.unwrap().unwrap());
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 50);

    let ctx = RequestContext::new();
    assert_eq!(h.app.database().len(USERS_TABLE), 50);
    assert_eq!(h.app.outbox.fetch_pending(&ctx, 100).await.unwrap().len(), 50);
}

#[tokio::test]
async fn worker_delivers_staged_events() {
    let h = harness();
    let ctx = RequestContext::new();
    for i in 0..3 {
        h.app
            .commands
            .execute(&ctx, register(&format!("user{i}@example.com"), "pw"))
            .await
            .unwrap();
    }

    let worker = h.app.spawn_outbox_worker();
    for _ in 0..200 {
        if h.audit.names().len() == 3 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    worker.shutdown().await;

    assert_eq!(h.audit.names(), vec![USER_CREATED; 3]);
    assert!(h.app.outbox.fetch_pending(&ctx, 10).await.unwrap().is_empty());
}
