use std::collections::BTreeSet;

use super::common::*;
use crate::workflows::enrollment::domain::{Capability, EnrollmentStatus, Field, Provider};
use crate::workflows::enrollment::policy::{acl, can, editable_fields, is_listable, Action};
use crate::workflows::enrollment::state_machine::TransitionEvent;
use crate::workflows::enrollment::variants::variant;

#[test]
fn outsider_has_nothing_to_edit_until_made_administrator() {
    let enrollment = record_in(EnrollmentStatus::UnderReview);
    let actor = outsider();

    let before = editable_fields(&actor, &enrollment);
    assert!(before.is_empty());

    let promoted = actor.with_capability(Capability::Administrator(Provider::ApiParticulier));
    let after = editable_fields(&promoted, &enrollment);
    assert!(after.is_superset(&before));
    assert!(after.len() > before.len());
    assert_eq!(
        after,
        BTreeSet::from([Field::ResponsableTraitement, Field::Dpo])
    );
}

#[test]
fn owner_edits_applicant_fields_while_draft() {
    let enrollment = record_in(EnrollmentStatus::Draft);
    let fields = editable_fields(&applicant(), &enrollment);

    for field in variant(Provider::ApiParticulier).applicant_fields {
        assert!(fields.contains(field), "{} should be editable", field.name());
    }
    assert!(fields.contains(&Field::Owner));
    assert!(!fields.contains(&Field::ResponsableTraitement));
}

#[test]
fn owner_loses_edit_rights_once_submitted() {
    let enrollment = record_in(EnrollmentStatus::UnderReview);
    let owner = applicant();

    assert!(!can(&owner, &enrollment, Action::Update));
    assert!(!can(&owner, &enrollment, Action::UpdateOwner));
    assert!(can(&owner, &enrollment, Action::UpdateRgpdContact));
    assert_eq!(
        editable_fields(&owner, &enrollment),
        BTreeSet::from([Field::ResponsableTraitement, Field::Dpo])
    );
}

#[test]
fn transitions_require_standing_and_an_edge() {
    let owner = applicant();
    let admin = administrator(Provider::ApiParticulier);
    let other_admin = administrator(Provider::Dgfip);

    let draft = record_in(EnrollmentStatus::Draft);
    let send = Action::Transition(TransitionEvent::SendApplication);
    assert!(can(&owner, &draft, send));
    assert!(!can(&admin, &draft, send));

    let submitted = record_in(EnrollmentStatus::UnderReview);
    let validate = Action::Transition(TransitionEvent::ValidateApplication);
    assert!(can(&admin, &submitted, validate));
    assert!(!can(&other_admin, &submitted, validate));
    assert!(!can(&owner, &submitted, validate));
    assert!(!can(&admin, &draft, validate));

    let archive = Action::Transition(TransitionEvent::Archive);
    let validated = record_in(EnrollmentStatus::Validated);
    assert!(can(&owner, &validated, archive));
    assert!(can(&admin, &validated, archive));
    assert!(!can(&outsider(), &validated, archive));
}

#[test]
fn delete_is_limited_to_owner_drafts() {
    let owner = applicant();
    assert!(can(&owner, &record_in(EnrollmentStatus::Draft), Action::Delete));
    assert!(!can(&owner, &record_in(EnrollmentStatus::Pending), Action::Delete));
    assert!(!can(
        &administrator(Provider::ApiParticulier),
        &record_in(EnrollmentStatus::Draft),
        Action::Delete
    ));
}

#[test]
fn validated_enrollments_are_viewable_by_anyone() {
    assert!(can(&outsider(), &record_in(EnrollmentStatus::Validated), Action::View));
    assert!(!can(&outsider(), &record_in(EnrollmentStatus::Pending), Action::View));
    assert!(can(
        &technical_contact(),
        &record_in(EnrollmentStatus::Pending),
        Action::View
    ));
}

#[test]
fn administrators_do_not_list_drafts() {
    let admin = administrator(Provider::ApiParticulier);
    assert!(!is_listable(&admin, &record_in(EnrollmentStatus::Draft)));
    assert!(is_listable(&admin, &record_in(EnrollmentStatus::UnderReview)));
    assert!(!is_listable(
        &administrator(Provider::Dgfip),
        &record_in(EnrollmentStatus::UnderReview)
    ));
    assert!(is_listable(&applicant(), &record_in(EnrollmentStatus::Draft)));
    assert!(is_listable(&technical_contact(), &record_in(EnrollmentStatus::Draft)));
}

#[test]
fn acl_covers_every_action() {
    let enrollment = record_in(EnrollmentStatus::Draft);
    let map = acl(&applicant(), &enrollment);

    let names: Vec<&str> = map.entries().map(|(name, _)| name).collect();
    assert_eq!(names.len(), Action::ALL.len());
    for action in Action::ALL {
        assert_eq!(map.allows(action), can(&applicant(), &enrollment, action));
    }
    assert!(map.allows(Action::Update));
    assert!(!map.allows(Action::Transition(TransitionEvent::ValidateApplication)));
}
