use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::response::Response;
use chrono::Utc;
use serde_json::{json, Value};

use crate::config::WorkflowConfig;
use crate::workflows::enrollment::domain::{
    Actor, Capability, Contact, Enrollment, EnrollmentId, EnrollmentPatch, EnrollmentStatus,
    OrganizationId, Provider, RgpdContact, UserId, UserRef,
};
use crate::workflows::enrollment::identity::{IdentityError, IdentityVerifier, VerifiedIdentity};
use crate::workflows::enrollment::notifications::{
    NotificationDispatcher, NotificationError, NotificationIntent,
};
use crate::workflows::enrollment::repository::{
    EnrollmentRepository, InMemoryEnrollmentRepository, RepositoryError,
};
use crate::workflows::enrollment::service::{
    EnrollmentService, NewEnrollment, RgpdContactsUpdate,
};
use crate::workflows::enrollment::state_machine::TransitionPayload;

pub(super) const ORGANIZATION: OrganizationId = OrganizationId(7);
pub(super) const APPLICANT_EMAIL: &str = "demandeur@mairie-lyon.fr";
pub(super) const TECHNICAL_EMAIL: &str = "dsi@mairie-lyon.fr";
pub(super) const CONTROLLER_EMAIL: &str = "maire@mairie-lyon.fr";

pub(super) type TestService =
    EnrollmentService<InMemoryEnrollmentRepository, RecordingDispatcher, StubIdentity>;

pub(super) fn workflow_config() -> WorkflowConfig {
    WorkflowConfig {
        front_host: "https://datapass.example".to_string(),
        identity_timeout: Duration::from_millis(200),
    }
}

pub(super) fn build_service() -> (
    TestService,
    Arc<InMemoryEnrollmentRepository>,
    Arc<RecordingDispatcher>,
) {
    build_service_with(StubIdentity::trusting())
}

pub(super) fn build_service_with(
    identity: StubIdentity,
) -> (
    TestService,
    Arc<InMemoryEnrollmentRepository>,
    Arc<RecordingDispatcher>,
) {
    let repository = Arc::new(InMemoryEnrollmentRepository::default());
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let service = EnrollmentService::new(
        repository.clone(),
        dispatcher.clone(),
        Arc::new(identity),
        workflow_config(),
    );
    (service, repository, dispatcher)
}

pub(super) fn applicant() -> Actor {
    Actor::new(UserId(1), APPLICANT_EMAIL)
        .with_capability(Capability::Applicant(Provider::ApiParticulier))
        .with_capability(Capability::Applicant(Provider::Dgfip))
        .with_organization(ORGANIZATION)
}

pub(super) fn administrator(provider: Provider) -> Actor {
    Actor::new(UserId(90), "instruction@dinum.gouv.fr")
        .with_capability(Capability::Administrator(provider))
}

pub(super) fn outsider() -> Actor {
    Actor::new(UserId(50), "curieux@exemple.fr")
}

/// Registered as the technical contact of `complete_patch` enrollments.
pub(super) fn technical_contact() -> Actor {
    Actor::new(UserId(60), TECHNICAL_EMAIL)
}

pub(super) fn complete_patch() -> EnrollmentPatch {
    EnrollmentPatch {
        title: Some("Tarification sociale de la cantine".to_string()),
        description: Some("Calcul du quotient familial pour la restauration scolaire".to_string()),
        legal_basis_title: Some("Délibération du conseil municipal".to_string()),
        siret: Some("21690123100011".to_string()),
        legal_name: Some("Commune de Lyon".to_string()),
        data_retention_period: Some(24),
        cgu_approved: Some(true),
        contacts: Some(vec![Contact {
            heading: "technique".to_string(),
            name: Some("Service informatique".to_string()),
            email: Some(TECHNICAL_EMAIL.to_string()),
            phone_number: None,
        }]),
        ..EnrollmentPatch::default()
    }
}

pub(super) fn dgfip_answers() -> BTreeMap<String, Value> {
    BTreeMap::from([
        ("production_ips".to_string(), json!("192.0.2.10")),
        ("recette_fonctionnelle".to_string(), json!(true)),
        ("autorite_homologation_nom".to_string(), json!("Claire Dupont")),
        ("autorite_homologation_fonction".to_string(), json!("DGS")),
        ("date_homologation".to_string(), json!("2024-01-15")),
        ("date_fin_homologation".to_string(), json!("2027-01-15")),
    ])
}

pub(super) fn controller() -> RgpdContact {
    RgpdContact {
        label: Some("Maire".to_string()),
        email: Some(CONTROLLER_EMAIL.to_string()),
        phone_number: None,
    }
}

pub(super) fn new_enrollment(provider: Provider, fields: EnrollmentPatch) -> NewEnrollment {
    NewEnrollment {
        provider: provider.as_str().to_string(),
        organization_id: ORGANIZATION,
        previous_enrollment_id: None,
        fields,
    }
}

/// Complete `api_particulier` draft owned by `applicant()`.
pub(super) fn complete_draft(service: &TestService) -> Enrollment {
    service
        .create_enrollment(
            &applicant(),
            new_enrollment(Provider::ApiParticulier, complete_patch()),
        )
        .expect("draft is created")
        .snapshot
        .enrollment
}

pub(super) async fn under_review(service: &TestService) -> Enrollment {
    let draft = complete_draft(service);
    service
        .trigger_transition(
            &applicant(),
            draft.id,
            "send_application",
            TransitionPayload::default(),
        )
        .await
        .expect("complete draft is sent")
        .snapshot
        .enrollment
}

/// Enrollment handed back to the applicant, with a data controller filled in.
pub(super) async fn pending(service: &TestService) -> Enrollment {
    let submitted = under_review(service).await;
    service
        .update_rgpd_contact(
            &applicant(),
            submitted.id,
            RgpdContactsUpdate {
                responsable_traitement: Some(controller()),
                dpo: None,
            },
        )
        .expect("owner sets the data controller");
    service
        .trigger_transition(
            &administrator(Provider::ApiParticulier),
            submitted.id,
            "review_application",
            TransitionPayload::with_comment("Merci de préciser la durée de conservation"),
        )
        .await
        .expect("administrator requests changes")
        .snapshot
        .enrollment
}

/// Detached record in `status`, for pure state machine and policy checks.
pub(super) fn record_in(status: EnrollmentStatus) -> Enrollment {
    let now = Utc::now();
    let mut enrollment = Enrollment::draft(
        EnrollmentId(1_000),
        Provider::ApiParticulier,
        UserRef {
            id: applicant().user_id,
            email: APPLICANT_EMAIL.to_string(),
        },
        ORGANIZATION,
        now,
    );
    complete_patch().apply_to(&mut enrollment, &[]);
    enrollment.advance_to(status, now);
    enrollment
}

#[derive(Default, Clone)]
pub(super) struct RecordingDispatcher {
    sent: Arc<Mutex<Vec<NotificationIntent>>>,
}

impl RecordingDispatcher {
    pub(super) fn sent(&self) -> Vec<NotificationIntent> {
        self.sent.lock().expect("dispatcher mutex poisoned").clone()
    }

    /// Delivery runs off the request path; poll until `done` holds or two seconds pass.
    pub(super) async fn wait_until(
        &self,
        done: impl Fn(&[NotificationIntent]) -> bool,
    ) -> Vec<NotificationIntent> {
        for _ in 0..200 {
            let sent = self.sent();
            if done(&sent) {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.sent()
    }
}

/// Records like `RecordingDispatcher` after blocking for `delay` per intent.
pub(super) struct SlowDispatcher {
    pub(super) delay: Duration,
    pub(super) inner: RecordingDispatcher,
}

impl NotificationDispatcher for SlowDispatcher {
    fn dispatch(&self, intent: NotificationIntent) -> Result<(), NotificationError> {
        std::thread::sleep(self.delay);
        self.inner.dispatch(intent)
    }
}

impl NotificationDispatcher for RecordingDispatcher {
    fn dispatch(&self, intent: NotificationIntent) -> Result<(), NotificationError> {
        self.sent
            .lock()
            .expect("dispatcher mutex poisoned")
            .push(intent);
        Ok(())
    }
}

pub(super) struct FailingDispatcher;

impl NotificationDispatcher for FailingDispatcher {
    fn dispatch(&self, _intent: NotificationIntent) -> Result<(), NotificationError> {
        Err(NotificationError::Transport("smtp relay down".to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) enum IdentityBehaviour {
    Trusting,
    UnverifiedEmail,
    LeftOrganization,
    Unreachable,
    Slow(Duration),
}

pub(super) struct StubIdentity {
    behaviour: IdentityBehaviour,
}

impl StubIdentity {
    pub(super) fn trusting() -> Self {
        Self::behaving(IdentityBehaviour::Trusting)
    }

    pub(super) fn behaving(behaviour: IdentityBehaviour) -> Self {
        Self { behaviour }
    }
}

#[async_trait]
impl IdentityVerifier for StubIdentity {
    async fn verify(&self, actor: &Actor) -> Result<VerifiedIdentity, IdentityError> {
        let trusted = VerifiedIdentity {
            email_verified: true,
            organization_ids: actor.organization_ids.clone(),
        };
        match self.behaviour {
            IdentityBehaviour::Trusting => Ok(trusted),
            IdentityBehaviour::UnverifiedEmail => Ok(VerifiedIdentity {
                email_verified: false,
                ..trusted
            }),
            IdentityBehaviour::LeftOrganization => Ok(VerifiedIdentity {
                organization_ids: Vec::new(),
                ..trusted
            }),
            IdentityBehaviour::Unreachable => Err(IdentityError::Unreachable(
                "connection refused".to_string(),
            )),
            IdentityBehaviour::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(trusted)
            }
        }
    }
}

pub(super) struct UnavailableRepository;

impl EnrollmentRepository for UnavailableRepository {
    fn insert(&self, _enrollment: Enrollment) -> Result<Enrollment, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn update(&self, _enrollment: Enrollment) -> Result<Enrollment, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn fetch(&self, _id: EnrollmentId) -> Result<Option<Enrollment>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn delete(&self, _id: EnrollmentId) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn matching(
        &self,
        _predicate: &(dyn Fn(&Enrollment) -> bool + Sync),
    ) -> Result<Vec<Enrollment>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
