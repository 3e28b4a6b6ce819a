//! Enrollment lifecycle: the record, the per-provider variant registry, the state
//! machine, the authorization rules, the audit log and the orchestrating service.
//!
//! Storage, email delivery and identity checks are collaborators behind traits so the
//! workflow can be driven in-process by tests and by the API service alike.

pub mod domain;
pub mod events;
pub mod identity;
pub mod listing;
pub mod notifications;
pub mod policy;
pub mod repository;
pub mod router;
pub mod service;
pub mod state_machine;
pub mod variants;

#[cfg(test)]
mod tests;

pub use domain::{
    Actor, Capability, Contact, Document, DocumentType, Enrollment, EnrollmentContent,
    EnrollmentId, EnrollmentPatch, EnrollmentStatus, Field, OrganizationId, Provider,
    RgpdContact, UserId, UserRef,
};
pub use events::{EnrollmentEvent, EventName, FieldChange, FieldDiff};
pub use identity::{IdentityError, IdentityVerifier, SessionClaimsVerifier, VerifiedIdentity};
pub use listing::{
    EnrollmentSummary, ListFilters, Page, PageMeta, PageRequest, PublicEnrollmentView,
    SortDirection,
};
pub use notifications::{
    NotificationDispatcher, NotificationError, NotificationIntent, NotificationTemplate,
    Recipient, RgpdRole,
};
pub use policy::{Acl, Action};
pub use repository::{EnrollmentRepository, InMemoryEnrollmentRepository, RepositoryError};
pub use router::{actor_from_headers, enrollment_router, SessionActor, SessionError};
pub use service::{
    EnrollmentError, EnrollmentService, EnrollmentSnapshot, NewEnrollment, RgpdContactsUpdate,
    WorkflowOutcome,
};
pub use state_machine::{StateMachine, TransitionError, TransitionEvent, TransitionPayload};
pub use variants::{variant_for, FieldError, UnknownProvider, ValidationErrors, VariantDescriptor};
