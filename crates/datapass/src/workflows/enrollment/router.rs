use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::domain::{
    Actor, Capability, EnrollmentId, EnrollmentPatch, EnrollmentStatus, OrganizationId, Provider,
    UserId, UserRef,
};
use super::identity::IdentityVerifier;
use super::listing::{
    EnrollmentSummary, ListFilters, Page, PageRequest, PublicEnrollmentView, SortDirection,
    DEFAULT_PAGE_SIZE,
};
use super::notifications::NotificationDispatcher;
use super::repository::EnrollmentRepository;
use super::service::{
    EnrollmentError, EnrollmentService, EnrollmentSnapshot, NewEnrollment, RgpdContactsUpdate,
    WorkflowOutcome,
};
use super::state_machine::TransitionPayload;

type Shared<R, N, I> = Arc<EnrollmentService<R, N, I>>;

/// Router exposing the enrollment lifecycle over HTTP.
pub fn enrollment_router<R, N, I>(service: Arc<EnrollmentService<R, N, I>>) -> Router
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    Router::new()
        .route(
            "/api/enrollments",
            get(list_handler::<R, N, I>).post(create_handler::<R, N, I>),
        )
        .route("/api/enrollments/public", get(public_handler::<R, N, I>))
        .route(
            "/api/enrollments/:id",
            get(get_handler::<R, N, I>)
                .patch(update_handler::<R, N, I>)
                .delete(delete_handler::<R, N, I>),
        )
        .route("/api/enrollments/:id/owner", patch(owner_handler::<R, N, I>))
        .route(
            "/api/enrollments/:id/rgpd_contacts",
            patch(rgpd_contacts_handler::<R, N, I>),
        )
        .route("/api/enrollments/:id/trigger", patch(trigger_handler::<R, N, I>))
        .route("/api/enrollments/:id/copy", post(copy_handler::<R, N, I>))
        .route("/api/enrollments/:id/copies", get(copies_handler::<R, N, I>))
        .route(
            "/api/enrollments/:id/next_enrollments",
            get(next_enrollments_handler::<R, N, I>),
        )
        .with_state(service)
}

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_CAPABILITIES_HEADER: &str = "x-user-capabilities";
pub const USER_ORGANIZATIONS_HEADER: &str = "x-user-organizations";
pub const USER_EMAIL_VERIFIED_HEADER: &str = "x-user-email-verified";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("missing session header '{0}'")]
    Missing(&'static str),
    #[error("invalid session header '{0}'")]
    Invalid(&'static str),
}

fn header<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<Option<&'a str>, SessionError> {
    headers
        .get(name)
        .map(|value| value.to_str().map_err(|_| SessionError::Invalid(name)))
        .transpose()
}

fn parse_capability(raw: &str) -> Option<Capability> {
    let (kind, provider) = raw.trim().split_once(':')?;
    let provider = Provider::parse(provider)?;
    match kind.trim() {
        "applicant" => Some(Capability::Applicant(provider)),
        "administrator" | "admin" => Some(Capability::Administrator(provider)),
        _ => None,
    }
}

/// Build the actor from the headers set by the upstream identity proxy.
///
/// Capabilities are a comma list of `applicant:<provider>` / `administrator:<provider>`,
/// organizations a comma list of ids.
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, SessionError> {
    let user_id = header(headers, USER_ID_HEADER)?
        .ok_or(SessionError::Missing(USER_ID_HEADER))?
        .trim()
        .parse::<u64>()
        .map_err(|_| SessionError::Invalid(USER_ID_HEADER))?;
    let email = header(headers, USER_EMAIL_HEADER)?
        .map(str::trim)
        .filter(|email| !email.is_empty())
        .ok_or(SessionError::Missing(USER_EMAIL_HEADER))?;

    let mut actor = Actor::new(UserId(user_id), email);

    if let Some(raw) = header(headers, USER_CAPABILITIES_HEADER)? {
        for entry in raw.split(',').filter(|entry| !entry.trim().is_empty()) {
            let capability =
                parse_capability(entry).ok_or(SessionError::Invalid(USER_CAPABILITIES_HEADER))?;
            actor = actor.with_capability(capability);
        }
    }

    if let Some(raw) = header(headers, USER_ORGANIZATIONS_HEADER)? {
        for entry in raw.split(',').filter(|entry| !entry.trim().is_empty()) {
            let id = entry
                .trim()
                .parse::<u64>()
                .map_err(|_| SessionError::Invalid(USER_ORGANIZATIONS_HEADER))?;
            actor = actor.with_organization(OrganizationId(id));
        }
    }

    if let Some(raw) = header(headers, USER_EMAIL_VERIFIED_HEADER)? {
        actor.email_verified = match raw.trim() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => return Err(SessionError::Invalid(USER_EMAIL_VERIFIED_HEADER)),
        };
    }

    Ok(actor)
}

/// Authenticated caller extracted from the session headers.
pub struct SessionActor(pub Actor);

#[async_trait]
impl<S> FromRequestParts<S> for SessionActor
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers)
            .map(SessionActor)
            .map_err(|err| {
                let payload = json!({ "error": err.to_string() });
                (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
            })
    }
}

impl IntoResponse for EnrollmentError {
    fn into_response(self) -> Response {
        let status = match &self {
            EnrollmentError::NotFound => StatusCode::NOT_FOUND,
            EnrollmentError::Forbidden(_) => StatusCode::FORBIDDEN,
            EnrollmentError::UnknownProvider(_)
            | EnrollmentError::EventNotPermitted { .. }
            | EnrollmentError::MissingRequiredComment(_) => StatusCode::BAD_REQUEST,
            EnrollmentError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            EnrollmentError::IdentityVerificationFailed(_) => StatusCode::UNAUTHORIZED,
            EnrollmentError::ConcurrentModification => StatusCode::CONFLICT,
            EnrollmentError::Repository(err) => {
                error!(error = %err, "enrollment storage failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let payload = match &self {
            EnrollmentError::ValidationFailed(errors) => json!({
                "error": "enrollment is incomplete",
                "fields": errors,
            }),
            other => json!({ "error": other.to_string() }),
        };
        (status, Json(payload)).into_response()
    }
}

/// Query string of the listing endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    pub status: Option<EnrollmentStatus>,
    pub provider: Option<Provider>,
    pub siret: Option<String>,
    pub legal_name: Option<String>,
    pub title: Option<String>,
    pub owner_email: Option<String>,
    pub archived: bool,
    pub sort: SortDirection,
    pub page: usize,
    pub size: Option<usize>,
}

impl ListParams {
    fn split(self) -> (ListFilters, SortDirection, PageRequest) {
        let page = PageRequest::new(self.page, self.size.unwrap_or(DEFAULT_PAGE_SIZE));
        let filters = ListFilters {
            status: self.status,
            provider: self.provider,
            siret: self.siret,
            legal_name: self.legal_name,
            title: self.title,
            owner_email: self.owner_email,
            archived: self.archived,
        };
        (filters, self.sort, page)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PublicParams {
    pub provider: Option<Provider>,
    pub page: usize,
    pub size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub event: String,
    #[serde(default)]
    pub comment: Option<String>,
}

pub(crate) async fn list_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    SessionActor(actor): SessionActor,
    Query(params): Query<ListParams>,
) -> Result<Json<Page<EnrollmentSummary>>, EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    let (filters, sort, page) = params.split();
    service
        .list_enrollments(&actor, &filters, sort, page)
        .map(Json)
}

pub(crate) async fn public_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    Query(params): Query<PublicParams>,
) -> Result<Json<Page<PublicEnrollmentView>>, EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    let page = PageRequest::new(params.page, params.size.unwrap_or(DEFAULT_PAGE_SIZE));
    service
        .list_public_validated(params.provider, page)
        .map(Json)
}

pub(crate) async fn create_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    SessionActor(actor): SessionActor,
    Json(request): Json<NewEnrollment>,
) -> Result<(StatusCode, Json<WorkflowOutcome>), EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    let outcome = service.create_enrollment(&actor, request)?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub(crate) async fn get_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    SessionActor(actor): SessionActor,
    Path(id): Path<u64>,
) -> Result<Json<EnrollmentSnapshot>, EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    service.get_enrollment(&actor, EnrollmentId(id)).map(Json)
}

pub(crate) async fn update_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    SessionActor(actor): SessionActor,
    Path(id): Path<u64>,
    Json(patch): Json<EnrollmentPatch>,
) -> Result<Json<WorkflowOutcome>, EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    service
        .update_enrollment(&actor, EnrollmentId(id), patch)
        .map(Json)
}

pub(crate) async fn delete_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    SessionActor(actor): SessionActor,
    Path(id): Path<u64>,
) -> Result<StatusCode, EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    service.delete_enrollment(&actor, EnrollmentId(id))?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn owner_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    SessionActor(actor): SessionActor,
    Path(id): Path<u64>,
    Json(new_owner): Json<UserRef>,
) -> Result<Json<WorkflowOutcome>, EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    service
        .update_owner(&actor, EnrollmentId(id), new_owner)
        .map(Json)
}

pub(crate) async fn rgpd_contacts_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    SessionActor(actor): SessionActor,
    Path(id): Path<u64>,
    Json(update): Json<RgpdContactsUpdate>,
) -> Result<Json<WorkflowOutcome>, EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    service
        .update_rgpd_contact(&actor, EnrollmentId(id), update)
        .map(Json)
}

pub(crate) async fn trigger_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    SessionActor(actor): SessionActor,
    Path(id): Path<u64>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<WorkflowOutcome>, EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    let payload = TransitionPayload {
        comment: request.comment,
    };
    service
        .trigger_transition(&actor, EnrollmentId(id), &request.event, payload)
        .await
        .map(Json)
}

pub(crate) async fn copy_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    SessionActor(actor): SessionActor,
    Path(id): Path<u64>,
) -> Result<(StatusCode, Json<WorkflowOutcome>), EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    let outcome = service.copy_enrollment(&actor, EnrollmentId(id))?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub(crate) async fn copies_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    SessionActor(actor): SessionActor,
    Path(id): Path<u64>,
) -> Result<Json<Vec<EnrollmentSummary>>, EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    service.list_copies(&actor, EnrollmentId(id)).map(Json)
}

pub(crate) async fn next_enrollments_handler<R, N, I>(
    State(service): State<Shared<R, N, I>>,
    SessionActor(actor): SessionActor,
    Path(id): Path<u64>,
) -> Result<Json<Vec<EnrollmentSummary>>, EnrollmentError>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    service
        .list_next_enrollments(&actor, EnrollmentId(id))
        .map(Json)
}
