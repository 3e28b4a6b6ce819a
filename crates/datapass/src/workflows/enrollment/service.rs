use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::WorkflowConfig;

use super::domain::{
    Actor, Enrollment, EnrollmentId, EnrollmentPatch, EnrollmentStatus, Field, OrganizationId,
    Provider, RgpdContact, UserRef,
};
use super::events::{diff_fields, EventName};
use super::identity::IdentityVerifier;
use super::listing::{
    paginate, EnrollmentSummary, ListFilters, Page, PageRequest, PublicEnrollmentView,
    SortDirection,
};
use super::notifications::{
    dispatch_all, NotificationBuilder, NotificationDispatcher, NotificationIntent,
    NotificationTemplate, RgpdRole,
};
use super::policy::{self, Acl, Action};
use super::repository::{EnrollmentRepository, RepositoryError};
use super::state_machine::{
    StateMachine, TransitionError, TransitionEvent, TransitionPayload, UnknownEvent,
};
use super::variants::{variant, variant_for, UnknownProvider, ValidationErrors};

/// Entry point of the enrollment lifecycle: loads, gates, transitions, records,
/// persists and hands notification intents to the dispatcher.
pub struct EnrollmentService<R, N, I> {
    repository: Arc<R>,
    dispatcher: Arc<N>,
    identity: Arc<I>,
    machine: StateMachine,
    identity_timeout: Duration,
    locks: TransitionLocks,
}

static ENROLLMENT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_enrollment_id() -> EnrollmentId {
    EnrollmentId(ENROLLMENT_SEQUENCE.fetch_add(1, Ordering::Relaxed))
}

type Slot = Arc<tokio::sync::Mutex<()>>;

/// One async lock per enrollment id, held across identity verification and commit.
/// Slots only live while some transition holds or awaits them.
#[derive(Default)]
struct TransitionLocks {
    slots: Mutex<HashMap<EnrollmentId, Slot>>,
}

impl TransitionLocks {
    fn lease(&self, id: EnrollmentId) -> SlotLease<'_> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        SlotLease {
            locks: self,
            id,
            slot: Arc::clone(slots.entry(id).or_default()),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

struct SlotLease<'a> {
    locks: &'a TransitionLocks,
    id: EnrollmentId,
    slot: Slot,
}

impl SlotLease<'_> {
    async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.slot.lock().await
    }
}

impl Drop for SlotLease<'_> {
    fn drop(&mut self) {
        let mut slots = self
            .locks
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The map and this lease are the only holders left.
        let idle = slots
            .get(&self.id)
            .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot) && Arc::strong_count(slot) == 2);
        if idle {
            slots.remove(&self.id);
        }
    }
}

/// Enrollment plus what the requesting actor may do with it.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentSnapshot {
    pub enrollment: Enrollment,
    pub acl: Acl,
    pub editable_fields: BTreeSet<Field>,
}

/// Snapshot after a committed write, with the intents handed to the dispatcher.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub snapshot: EnrollmentSnapshot,
    pub notifications: Vec<NotificationIntent>,
}

/// Creation request. `fields` is clipped to what the provider lets applicants write.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEnrollment {
    pub provider: String,
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub previous_enrollment_id: Option<EnrollmentId>,
    #[serde(flatten)]
    pub fields: EnrollmentPatch,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RgpdContactsUpdate {
    pub responsable_traitement: Option<RgpdContact>,
    pub dpo: Option<RgpdContact>,
}

impl<R, N, I> EnrollmentService<R, N, I>
where
    R: EnrollmentRepository + 'static,
    N: NotificationDispatcher + 'static,
    I: IdentityVerifier + 'static,
{
    pub fn new(
        repository: Arc<R>,
        dispatcher: Arc<N>,
        identity: Arc<I>,
        config: WorkflowConfig,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            identity,
            machine: StateMachine::new(NotificationBuilder::new(config.front_host)),
            identity_timeout: config.identity_timeout,
            locks: TransitionLocks::default(),
        }
    }

    fn notifications(&self) -> &NotificationBuilder {
        self.machine.notifications()
    }

    /// Hands intents to the dispatcher without waiting for delivery. Outside a tokio
    /// runtime they are delivered inline.
    fn hand_off(&self, intents: &[NotificationIntent]) {
        if intents.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let dispatcher = Arc::clone(&self.dispatcher);
                let intents = intents.to_vec();
                runtime.spawn_blocking(move || dispatch_all(dispatcher.as_ref(), &intents));
            }
            Err(_) => dispatch_all(self.dispatcher.as_ref(), intents),
        }
    }

    #[cfg(test)]
    pub(crate) fn transition_lock_count(&self) -> usize {
        self.locks.len()
    }

    fn snapshot(&self, actor: &Actor, enrollment: Enrollment) -> EnrollmentSnapshot {
        EnrollmentSnapshot {
            acl: policy::acl(actor, &enrollment),
            editable_fields: policy::editable_fields(actor, &enrollment),
            enrollment,
        }
    }

    /// Listable records, plus validated ones anyone may know about.
    fn in_scope(actor: &Actor, enrollment: &Enrollment) -> bool {
        policy::is_listable(actor, enrollment)
            || (enrollment.status() == EnrollmentStatus::Validated
                && policy::can(actor, enrollment, Action::View))
    }

    /// Records the actor cannot see are reported as absent.
    fn load_in_scope(
        &self,
        actor: &Actor,
        id: EnrollmentId,
    ) -> Result<Enrollment, EnrollmentError> {
        let enrollment = self
            .repository
            .fetch(id)?
            .ok_or(EnrollmentError::NotFound)?;
        if !Self::in_scope(actor, &enrollment) {
            debug!(
                enrollment_id = %id,
                user_id = %actor.user_id,
                "enrollment outside actor scope"
            );
            return Err(EnrollmentError::NotFound);
        }
        Ok(enrollment)
    }

    /// Like `load_in_scope`, but refuses callers who only see the public projection.
    fn load_full_record(
        &self,
        actor: &Actor,
        id: EnrollmentId,
    ) -> Result<Enrollment, EnrollmentError> {
        let enrollment = self.load_in_scope(actor, id)?;
        if !policy::is_listable(actor, &enrollment) {
            warn!(
                enrollment_id = %id,
                user_id = %actor.user_id,
                "full record refused to public viewer"
            );
            return Err(EnrollmentError::Forbidden(Action::View.name()));
        }
        Ok(enrollment)
    }

    fn authorize(
        actor: &Actor,
        enrollment: &Enrollment,
        action: Action,
    ) -> Result<(), EnrollmentError> {
        if policy::can(actor, enrollment, action) {
            return Ok(());
        }
        warn!(
            enrollment_id = %enrollment.id,
            user_id = %actor.user_id,
            action = action.name(),
            status = enrollment.status().label(),
            "action refused"
        );
        Err(EnrollmentError::Forbidden(action.name()))
    }

    pub fn list_enrollments(
        &self,
        actor: &Actor,
        filters: &ListFilters,
        sort: SortDirection,
        page: PageRequest,
    ) -> Result<Page<EnrollmentSummary>, EnrollmentError> {
        let visible = self.repository.matching(&|enrollment: &Enrollment| {
            policy::is_listable(actor, enrollment) && filters.matches(enrollment)
        })?;
        Ok(paginate(visible, sort, page))
    }

    /// Full record and ACL. Callers who only see the public projection get `Forbidden`.
    pub fn get_enrollment(
        &self,
        actor: &Actor,
        id: EnrollmentId,
    ) -> Result<EnrollmentSnapshot, EnrollmentError> {
        let enrollment = self.load_full_record(actor, id)?;
        Ok(self.snapshot(actor, enrollment))
    }

    /// Validated enrollments, most recently updated first. Needs no actor.
    pub fn list_public_validated(
        &self,
        provider: Option<Provider>,
        page: PageRequest,
    ) -> Result<Page<PublicEnrollmentView>, EnrollmentError> {
        let validated = self.repository.matching(&|enrollment: &Enrollment| {
            enrollment.status() == EnrollmentStatus::Validated
                && provider.map_or(true, |wanted| wanted == enrollment.provider)
        })?;
        Ok(paginate(validated, SortDirection::Desc, page))
    }

    pub fn create_enrollment(
        &self,
        actor: &Actor,
        request: NewEnrollment,
    ) -> Result<WorkflowOutcome, EnrollmentError> {
        let descriptor = variant_for(&request.provider)?;
        let now = Utc::now();

        let mut enrollment = Enrollment::draft(
            next_enrollment_id(),
            descriptor.provider,
            actor.as_user_ref(),
            request.organization_id,
            now,
        );
        Self::authorize(actor, &enrollment, Action::Create)?;

        if let Some(previous_id) = request.previous_enrollment_id {
            let previous = self.load_full_record(actor, previous_id)?;
            enrollment.previous_enrollment_id = Some(previous.id);
        }

        let allowed: BTreeSet<Field> = descriptor.applicant_fields.iter().copied().collect();
        request
            .fields
            .clip(&allowed)
            .apply_to(&mut enrollment, descriptor.additional_keys);
        enrollment.record_event(EventName::Created, Some(actor.user_id), None, None, now);

        let stored = self.repository.insert(enrollment)?;
        info!(
            enrollment_id = %stored.id,
            provider = %stored.provider,
            user_id = %actor.user_id,
            "enrollment created"
        );

        let notifications = vec![self.notifications().to_owner(
            &stored,
            NotificationTemplate::CreateApplication,
            None,
        )];
        self.hand_off(&notifications);

        Ok(WorkflowOutcome {
            snapshot: self.snapshot(actor, stored),
            notifications,
        })
    }

    /// Applicant edit. Fields the actor may not write are dropped, not rejected.
    pub fn update_enrollment(
        &self,
        actor: &Actor,
        id: EnrollmentId,
        patch: EnrollmentPatch,
    ) -> Result<WorkflowOutcome, EnrollmentError> {
        let current = self.load_in_scope(actor, id)?;
        Self::authorize(actor, &current, Action::Update)?;

        let editable = policy::editable_fields(actor, &current);
        let requested = patch.fields();
        let ignored: Vec<&str> = requested
            .difference(&editable)
            .map(|field| field.name())
            .collect();
        if !ignored.is_empty() {
            debug!(
                enrollment_id = %id,
                ignored = ?ignored,
                "dropping fields outside editable set"
            );
        }

        let touched: BTreeSet<Field> = requested.intersection(&editable).copied().collect();
        let mut next = current.clone();
        patch
            .clip(&editable)
            .apply_to(&mut next, variant(current.provider).additional_keys);

        let notifications = self.rgpd_reassignment_intents(actor, &current, &next);
        self.commit_update(actor, current, next, &touched, notifications)
    }

    pub fn update_owner(
        &self,
        actor: &Actor,
        id: EnrollmentId,
        new_owner: UserRef,
    ) -> Result<WorkflowOutcome, EnrollmentError> {
        let current = self.load_in_scope(actor, id)?;
        Self::authorize(actor, &current, Action::UpdateOwner)?;

        let mut next = current.clone();
        next.owner = new_owner;

        let notifications = if next.owner != current.owner {
            vec![self
                .notifications()
                .to_owner(&next, NotificationTemplate::OwnerChanged, None)]
        } else {
            Vec::new()
        };
        let touched = BTreeSet::from([Field::Owner]);
        self.commit_update(actor, current, next, &touched, notifications)
    }

    pub fn update_rgpd_contact(
        &self,
        actor: &Actor,
        id: EnrollmentId,
        update: RgpdContactsUpdate,
    ) -> Result<WorkflowOutcome, EnrollmentError> {
        let current = self.load_in_scope(actor, id)?;
        Self::authorize(actor, &current, Action::UpdateRgpdContact)?;

        let allowed: BTreeSet<Field> = Action::UpdateRgpdContact
            .fields(&current)
            .iter()
            .copied()
            .collect();
        let patch = EnrollmentPatch {
            responsable_traitement: update.responsable_traitement,
            dpo: update.dpo,
            ..EnrollmentPatch::default()
        };
        let touched = patch.fields();

        let mut next = current.clone();
        patch.clip(&allowed).apply_to(&mut next, &[]);

        let notifications = self.rgpd_reassignment_intents(actor, &current, &next);
        self.commit_update(actor, current, next, &touched, notifications)
    }

    /// Notices for RGPD contacts whose email changed, plus a summary to the
    /// provider's administrators. Drafts notify nobody.
    fn rgpd_reassignment_intents(
        &self,
        actor: &Actor,
        before: &Enrollment,
        after: &Enrollment,
    ) -> Vec<NotificationIntent> {
        if after.status() == EnrollmentStatus::Draft {
            return Vec::new();
        }

        let mut intents: Vec<NotificationIntent> = RgpdRole::ALL
            .into_iter()
            .filter(|role| role.contact(before).email() != role.contact(after).email())
            .filter_map(|role| self.notifications().rgpd_contact(after, role))
            .collect();

        let blocks_changed = RgpdRole::ALL
            .into_iter()
            .any(|role| role.contact(before) != role.contact(after));
        if blocks_changed {
            intents.push(self.notifications().to_administrators(
                after,
                NotificationTemplate::UpdateContacts,
                &actor.email,
            ));
        }
        intents
    }

    /// Persist `next` with an `updated` event. A write that changes nothing is a no-op.
    fn commit_update(
        &self,
        actor: &Actor,
        current: Enrollment,
        mut next: Enrollment,
        touched: &BTreeSet<Field>,
        notifications: Vec<NotificationIntent>,
    ) -> Result<WorkflowOutcome, EnrollmentError> {
        let diff = diff_fields(&current, &next, touched);
        if diff.is_empty() {
            debug!(enrollment_id = %current.id, "update carried no changes");
            return Ok(WorkflowOutcome {
                snapshot: self.snapshot(actor, current),
                notifications: Vec::new(),
            });
        }

        let now = Utc::now();
        let changed: Vec<String> = diff.keys().cloned().collect();
        next.updated_at = now;
        next.record_event(EventName::Updated, Some(actor.user_id), None, Some(diff), now);

        let stored = self.repository.update(next)?;
        info!(
            enrollment_id = %stored.id,
            user_id = %actor.user_id,
            fields = ?changed,
            "enrollment updated"
        );
        self.hand_off(&notifications);

        Ok(WorkflowOutcome {
            snapshot: self.snapshot(actor, stored),
            notifications,
        })
    }

    /// Run `event` against the enrollment. Concurrent transitions on the same id
    /// are serialized; the loser observes the new state.
    pub async fn trigger_transition(
        &self,
        actor: &Actor,
        id: EnrollmentId,
        event: &str,
        payload: TransitionPayload,
    ) -> Result<WorkflowOutcome, EnrollmentError> {
        let event: TransitionEvent = event.parse().map_err(|UnknownEvent(raw)| {
            EnrollmentError::EventNotPermitted {
                event: raw,
                status: None,
            }
        })?;

        let lease = self.locks.lease(id);
        let held = lease.acquire().await;

        let current = self.load_in_scope(actor, id)?;
        self.machine.ensure_edge(&current, event)?;
        Self::authorize(actor, &current, Action::Transition(event))?;

        let transition = self
            .machine
            .apply(&current, event, actor, &payload, Utc::now())?;

        if event.requires_identity_check() {
            self.verify_identity(actor, &current).await?;
        }

        let stored = self.repository.update(transition.enrollment)?;
        info!(
            enrollment_id = %stored.id,
            event = %event,
            user_id = %actor.user_id,
            from = current.status().label(),
            to = stored.status().label(),
            "transition committed"
        );
        drop(held);
        drop(lease);
        self.hand_off(&transition.notifications);

        Ok(WorkflowOutcome {
            snapshot: self.snapshot(actor, stored),
            notifications: transition.notifications,
        })
    }

    async fn verify_identity(
        &self,
        actor: &Actor,
        enrollment: &Enrollment,
    ) -> Result<(), EnrollmentError> {
        let check = self.identity.verify(actor);
        let verified = match tokio::time::timeout(self.identity_timeout, check).await {
            Ok(Ok(verified)) => verified,
            Ok(Err(err)) => {
                warn!(user_id = %actor.user_id, error = %err, "identity verification failed");
                return Err(EnrollmentError::IdentityVerificationFailed(err.to_string()));
            }
            Err(_) => {
                warn!(
                    user_id = %actor.user_id,
                    timeout_ms = self.identity_timeout.as_millis() as u64,
                    "identity verification timed out"
                );
                return Err(EnrollmentError::IdentityVerificationFailed(
                    "identity provider did not answer in time".to_string(),
                ));
            }
        };

        if !verified.email_verified {
            return Err(EnrollmentError::IdentityVerificationFailed(
                "email address is not verified".to_string(),
            ));
        }
        if !verified.belongs_to(enrollment.organization_id) {
            return Err(EnrollmentError::IdentityVerificationFailed(
                "user no longer belongs to the enrollment's organization".to_string(),
            ));
        }
        Ok(())
    }

    /// New draft owned by `actor` carrying the source's content. Documents and
    /// history stay behind.
    pub fn copy_enrollment(
        &self,
        actor: &Actor,
        id: EnrollmentId,
    ) -> Result<WorkflowOutcome, EnrollmentError> {
        let source = self.load_full_record(actor, id)?;
        let now = Utc::now();

        let mut copy = source.duplicate(next_enrollment_id(), actor.as_user_ref(), now);
        Self::authorize(actor, &copy, Action::Create)?;
        copy.record_event(EventName::Created, Some(actor.user_id), None, None, now);

        let stored = self.repository.insert(copy)?;
        info!(
            enrollment_id = %stored.id,
            copied_from = %source.id,
            user_id = %actor.user_id,
            "enrollment copied"
        );

        let notifications = vec![self.notifications().to_owner(
            &stored,
            NotificationTemplate::CreateApplication,
            None,
        )];
        self.hand_off(&notifications);

        Ok(WorkflowOutcome {
            snapshot: self.snapshot(actor, stored),
            notifications,
        })
    }

    pub fn list_copies(
        &self,
        actor: &Actor,
        id: EnrollmentId,
    ) -> Result<Vec<EnrollmentSummary>, EnrollmentError> {
        self.lineage(actor, id, |enrollment| enrollment.copied_from_enrollment_id)
    }

    pub fn list_next_enrollments(
        &self,
        actor: &Actor,
        id: EnrollmentId,
    ) -> Result<Vec<EnrollmentSummary>, EnrollmentError> {
        self.lineage(actor, id, |enrollment| enrollment.previous_enrollment_id)
    }

    fn lineage(
        &self,
        actor: &Actor,
        id: EnrollmentId,
        link: fn(&Enrollment) -> Option<EnrollmentId>,
    ) -> Result<Vec<EnrollmentSummary>, EnrollmentError> {
        let source = self.load_in_scope(actor, id)?;
        let mut linked = self.repository.matching(&|enrollment: &Enrollment| {
            link(enrollment) == Some(source.id) && Self::in_scope(actor, enrollment)
        })?;
        linked.sort_by_key(|enrollment| enrollment.id);
        Ok(linked.iter().map(EnrollmentSummary::from).collect())
    }

    pub fn delete_enrollment(
        &self,
        actor: &Actor,
        id: EnrollmentId,
    ) -> Result<(), EnrollmentError> {
        let current = self.load_in_scope(actor, id)?;
        Self::authorize(actor, &current, Action::Delete)?;

        self.repository.delete(id)?;
        info!(enrollment_id = %id, user_id = %actor.user_id, "enrollment deleted");
        Ok(())
    }
}

/// Error raised by the enrollment service.
#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("enrollment not found")]
    NotFound,
    #[error("action '{0}' is not allowed")]
    Forbidden(&'static str),
    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),
    #[error("event '{event}' is not permitted{}", from_state(.status))]
    EventNotPermitted {
        event: String,
        status: Option<EnrollmentStatus>,
    },
    #[error("a comment is required for '{0}'")]
    MissingRequiredComment(TransitionEvent),
    #[error("enrollment is incomplete: {0}")]
    ValidationFailed(ValidationErrors),
    #[error("identity verification failed: {0}")]
    IdentityVerificationFailed(String),
    #[error("enrollment was modified concurrently")]
    ConcurrentModification,
    #[error(transparent)]
    Repository(RepositoryError),
}

fn from_state(status: &Option<EnrollmentStatus>) -> String {
    status
        .map(|status| format!(" from state '{}'", status.label()))
        .unwrap_or_default()
}

impl From<TransitionError> for EnrollmentError {
    fn from(value: TransitionError) -> Self {
        match value {
            TransitionError::EventNotPermitted { event, status } => Self::EventNotPermitted {
                event,
                status: Some(status),
            },
            TransitionError::MissingRequiredComment(event) => Self::MissingRequiredComment(event),
            TransitionError::ValidationFailed(errors) => Self::ValidationFailed(errors),
        }
    }
}

impl From<RepositoryError> for EnrollmentError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::StaleRevision { .. } => Self::ConcurrentModification,
            RepositoryError::NotFound => Self::NotFound,
            other => Self::Repository(other),
        }
    }
}
