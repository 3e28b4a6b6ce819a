//! Authorization rules for enrollments.
//!
//! Decisions depend on the enrollment's current state, the actor's relationship to
//! it (owner, registered contact) and the capabilities passed in with the actor.
//! Nothing here is cached: callers recompute per request.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::domain::{Actor, Enrollment, EnrollmentStatus, Field};
use super::state_machine::{target, TransitionEvent};
use super::variants::variant;

/// Everything a caller can ask to do with an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Action {
    View,
    Create,
    Update,
    UpdateOwner,
    UpdateRgpdContact,
    Delete,
    Transition(TransitionEvent),
}

impl Action {
    /// Static action list backing the ACL.
    pub const ALL: [Action; 11] = [
        Action::View,
        Action::Create,
        Action::Update,
        Action::UpdateOwner,
        Action::UpdateRgpdContact,
        Action::Delete,
        Action::Transition(TransitionEvent::SendApplication),
        Action::Transition(TransitionEvent::ReviewApplication),
        Action::Transition(TransitionEvent::ValidateApplication),
        Action::Transition(TransitionEvent::RefuseApplication),
        Action::Transition(TransitionEvent::Archive),
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Create => "create",
            Action::Update => "update",
            Action::UpdateOwner => "update_owner",
            Action::UpdateRgpdContact => "update_rgpd_contact",
            Action::Delete => "delete",
            Action::Transition(event) => event.name(),
        }
    }

    /// Fields this action lets its holder write.
    pub fn fields(self, enrollment: &Enrollment) -> &'static [Field] {
        match self {
            Action::Update => variant(enrollment.provider).applicant_fields,
            Action::UpdateOwner => &[Field::Owner],
            Action::UpdateRgpdContact => &[Field::ResponsableTraitement, Field::Dpo],
            Action::View | Action::Create | Action::Delete | Action::Transition(_) => &[],
        }
    }
}

/// Per-request map of action name to permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Acl(BTreeMap<&'static str, bool>);

impl Acl {
    pub fn allows(&self, action: Action) -> bool {
        self.0.get(action.name()).copied().unwrap_or(false)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&'static str, bool)> + '_ {
        self.0.iter().map(|(name, allowed)| (*name, *allowed))
    }
}

fn is_contact(actor: &Actor, enrollment: &Enrollment) -> bool {
    enrollment.has_contact_email(&actor.email)
}

pub fn can(actor: &Actor, enrollment: &Enrollment, action: Action) -> bool {
    let status = enrollment.status();
    let is_owner = enrollment.is_owned_by(actor.user_id);
    let is_admin = actor.is_admin_of(enrollment.provider);

    match action {
        Action::View => {
            is_owner
                || is_admin
                || is_contact(actor, enrollment)
                || status == EnrollmentStatus::Validated
        }
        Action::Create => actor.can_apply_for(enrollment.provider),
        Action::Update | Action::UpdateOwner => {
            is_owner && matches!(status, EnrollmentStatus::Draft | EnrollmentStatus::Pending)
        }
        Action::UpdateRgpdContact => status != EnrollmentStatus::Draft && (is_owner || is_admin),
        Action::Delete => is_owner && status == EnrollmentStatus::Draft,
        Action::Transition(event) => {
            let edge_exists = target(variant(enrollment.provider).edges, status, event).is_some();
            let has_standing = match event {
                TransitionEvent::SendApplication => is_owner,
                TransitionEvent::ReviewApplication
                | TransitionEvent::ValidateApplication
                | TransitionEvent::RefuseApplication => is_admin,
                TransitionEvent::Archive => is_owner || is_admin,
            };
            edge_exists && has_standing
        }
    }
}

/// Union of the field sets of every action currently permitted to `actor`.
pub fn editable_fields(actor: &Actor, enrollment: &Enrollment) -> BTreeSet<Field> {
    Action::ALL
        .into_iter()
        .filter(|action| can(actor, enrollment, *action))
        .flat_map(|action| action.fields(enrollment).iter().copied())
        .collect()
}

pub fn acl(actor: &Actor, enrollment: &Enrollment) -> Acl {
    Acl(Action::ALL
        .into_iter()
        .map(|action| (action.name(), can(actor, enrollment, action)))
        .collect())
}

/// Whether `enrollment` belongs to the actor's listing scope. Administrators see every
/// submitted enrollment of their providers; everyone sees what they own or are a
/// contact for.
pub fn is_listable(actor: &Actor, enrollment: &Enrollment) -> bool {
    enrollment.is_owned_by(actor.user_id)
        || is_contact(actor, enrollment)
        || (actor.is_admin_of(enrollment.provider)
            && enrollment.status() != EnrollmentStatus::Draft)
}
