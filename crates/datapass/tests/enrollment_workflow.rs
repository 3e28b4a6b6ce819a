//! End-to-end scenarios for the enrollment lifecycle, driven through the public service
//! facade and the HTTP router only.

mod common {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use datapass::config::WorkflowConfig;
    use datapass::workflows::enrollment::{
        Actor, Capability, EnrollmentService, InMemoryEnrollmentRepository,
        NotificationDispatcher, NotificationError, NotificationIntent, OrganizationId, Provider,
        SessionClaimsVerifier, UserId,
    };

    pub(super) type Service =
        EnrollmentService<InMemoryEnrollmentRepository, Outbox, SessionClaimsVerifier>;

    #[derive(Default, Clone)]
    pub(super) struct Outbox {
        intents: Arc<Mutex<Vec<NotificationIntent>>>,
    }

    impl Outbox {
        /// Takes everything delivered so far once at least `count` intents arrived,
        /// giving up after two seconds.
        pub(super) async fn drain_after(&self, count: usize) -> Vec<NotificationIntent> {
            for _ in 0..200 {
                if self.intents.lock().expect("outbox mutex poisoned").len() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            std::mem::take(&mut *self.intents.lock().expect("outbox mutex poisoned"))
        }
    }

    impl NotificationDispatcher for Outbox {
        fn dispatch(&self, intent: NotificationIntent) -> Result<(), NotificationError> {
            self.intents
                .lock()
                .expect("outbox mutex poisoned")
                .push(intent);
            Ok(())
        }
    }

    pub(super) fn service() -> (Arc<Service>, Outbox) {
        let outbox = Outbox::default();
        let service = EnrollmentService::new(
            Arc::new(InMemoryEnrollmentRepository::default()),
            Arc::new(outbox.clone()),
            Arc::new(SessionClaimsVerifier),
            WorkflowConfig {
                front_host: "https://datapass.example".to_string(),
                identity_timeout: Duration::from_secs(1),
            },
        );
        (Arc::new(service), outbox)
    }

    pub(super) fn applicant() -> Actor {
        Actor::new(UserId(11), "secretariat@cc-vallee.fr")
            .with_capability(Capability::Applicant(Provider::ApiEntreprise))
            .with_organization(OrganizationId(21))
    }

    pub(super) fn instructor() -> Actor {
        Actor::new(UserId(12), "instruction@api.gouv.fr")
            .with_capability(Capability::Administrator(Provider::ApiEntreprise))
    }
}

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use datapass::workflows::enrollment::{
    enrollment_router, EnrollmentError, EnrollmentPatch, EnrollmentStatus, EventName,
    NewEnrollment, NotificationTemplate, OrganizationId, PageRequest, Provider, Recipient,
    TransitionPayload,
};

use common::*;

fn complete_request() -> NewEnrollment {
    NewEnrollment {
        provider: "api_entreprise".to_string(),
        organization_id: OrganizationId(21),
        previous_enrollment_id: None,
        fields: serde_json::from_value::<EnrollmentPatch>(json!({
            "title": "Marchés publics de la communauté de communes",
            "description": "Vérification des candidats lors des appels d'offres",
            "legal_basis_title": "Code de la commande publique",
            "siret": "20004012300017",
            "legal_name": "Communauté de communes de la Vallée",
            "data_retention_period": 12,
            "cgu_approved": true,
            "contacts": [
                { "heading": "technique", "email": "informatique@cc-vallee.fr" }
            ]
        }))
        .expect("patch payload"),
    }
}

#[tokio::test]
async fn enrollment_goes_from_draft_to_archive_with_a_round_trip_to_the_applicant() {
    let (service, outbox) = service();
    let draft = service
        .create_enrollment(&applicant(), complete_request())
        .expect("draft created")
        .snapshot
        .enrollment;
    outbox.drain_after(1).await;

    let steps = [
        (applicant(), "send_application", None, EnrollmentStatus::UnderReview),
        (
            instructor(),
            "review_application",
            Some("Précisez les destinataires des données"),
            EnrollmentStatus::Pending,
        ),
        (applicant(), "send_application", None, EnrollmentStatus::UnderReview),
        (instructor(), "validate_application", None, EnrollmentStatus::Validated),
        (applicant(), "archive", None, EnrollmentStatus::Archived),
    ];
    let mut handed_off = 0;
    for (actor, event, comment, expected) in steps {
        let payload = TransitionPayload {
            comment: comment.map(str::to_string),
        };
        let outcome = service
            .trigger_transition(&actor, draft.id, event, payload)
            .await
            .unwrap_or_else(|err| panic!("{event} failed: {err}"));
        assert_eq!(outcome.snapshot.enrollment.status(), expected, "after {event}");
        handed_off += outcome.notifications.len();
    }

    let archived = service
        .get_enrollment(&applicant(), draft.id)
        .expect("owner still reads the record");
    let history: Vec<EventName> = archived
        .enrollment
        .events()
        .iter()
        .map(|event| event.name)
        .collect();
    assert_eq!(
        history,
        vec![
            EventName::Created,
            EventName::SendApplication,
            EventName::ReviewApplication,
            EventName::SendApplication,
            EventName::ValidateApplication,
            EventName::Archive,
        ]
    );
    let review = archived
        .enrollment
        .events()
        .named(EventName::ReviewApplication)
        .next()
        .expect("review recorded");
    assert_eq!(review.user_id, Some(instructor().user_id));
    assert_eq!(
        review.comment.as_deref(),
        Some("Précisez les destinataires des données")
    );

    let sent = outbox.drain_after(handed_off).await;
    assert_eq!(sent.len(), handed_off);
    assert!(sent.iter().any(|intent| {
        intent.template == NotificationTemplate::ReviewApplication
            && intent.extra_params.get("message").map(String::as_str)
                == Some("Précisez les destinataires des données")
    }));
    let administrators = Recipient::ProviderAdministrators(Provider::ApiEntreprise);
    assert_eq!(
        sent.iter()
            .filter(|intent| intent.to == administrators)
            .count(),
        2,
        "administrators hear about both submissions"
    );

    let public = service
        .list_public_validated(None, PageRequest::default())
        .expect("public listing");
    assert!(public.items.is_empty(), "archived records leave the public listing");
}

#[tokio::test]
async fn refused_enrollment_cannot_be_resubmitted() {
    let (service, _) = service();
    let draft = service
        .create_enrollment(&applicant(), complete_request())
        .expect("draft created")
        .snapshot
        .enrollment;
    service
        .trigger_transition(
            &applicant(),
            draft.id,
            "send_application",
            TransitionPayload::default(),
        )
        .await
        .expect("sent");
    service
        .trigger_transition(
            &instructor(),
            draft.id,
            "refuse_application",
            TransitionPayload::with_comment("Aucune base légale"),
        )
        .await
        .expect("refused");

    let err = service
        .trigger_transition(
            &applicant(),
            draft.id,
            "send_application",
            TransitionPayload::default(),
        )
        .await
        .expect_err("refusal is final");
    assert!(matches!(
        err,
        EnrollmentError::EventNotPermitted {
            status: Some(EnrollmentStatus::Refused),
            ..
        }
    ));
}

#[tokio::test]
async fn http_lifecycle_reports_acl_changes() {
    let (service, _) = service();
    let router = enrollment_router(service);

    let create = Request::post("/api/enrollments")
        .header("x-user-id", "11")
        .header("x-user-email", "secretariat@cc-vallee.fr")
        .header("x-user-capabilities", "applicant:api_entreprise")
        .header("x-user-organizations", "21")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({
                "provider": "api_entreprise",
                "organization_id": 21,
                "title": "Marchés publics",
                "description": "Vérification des candidats",
                "legal_basis_title": "Code de la commande publique",
                "siret": "20004012300017",
                "legal_name": "Communauté de communes de la Vallée",
                "data_retention_period": 12,
                "cgu_approved": true,
                "contacts": [{ "heading": "technique", "email": "informatique@cc-vallee.fr" }]
            })
            .to_string(),
        ))
        .expect("request builds");
    let response = router.clone().oneshot(create).await.expect("route executes");
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = read_json(response).await;
    let id = created["snapshot"]["enrollment"]["id"]
        .as_u64()
        .expect("numeric id");

    let send = Request::patch(format!("/api/enrollments/{id}/trigger"))
        .header("x-user-id", "11")
        .header("x-user-email", "secretariat@cc-vallee.fr")
        .header("x-user-capabilities", "applicant:api_entreprise")
        .header("x-user-organizations", "21")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "event": "send_application" }).to_string()))
        .expect("request builds");
    let response = router.clone().oneshot(send).await.expect("route executes");
    assert_eq!(response.status(), StatusCode::OK);
    let sent = read_json(response).await;
    assert_eq!(sent["snapshot"]["acl"]["update"], false);
    assert_eq!(sent["snapshot"]["acl"]["update_rgpd_contact"], true);

    let review_without_comment = Request::patch(format!("/api/enrollments/{id}/trigger"))
        .header("x-user-id", "12")
        .header("x-user-email", "instruction@api.gouv.fr")
        .header("x-user-capabilities", "administrator:api_entreprise")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "event": "review_application" }).to_string()))
        .expect("request builds");
    let response = router
        .oneshot(review_without_comment)
        .await
        .expect("route executes");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

async fn read_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
