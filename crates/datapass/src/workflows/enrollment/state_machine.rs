use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{Actor, Enrollment, EnrollmentStatus};
use super::events::EnrollmentEvent;
use super::notifications::{NotificationBuilder, NotificationIntent, NotificationTemplate, RgpdRole};
use super::variants::{variant, ValidationErrors};

/// Events that move an enrollment between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEvent {
    SendApplication,
    ReviewApplication,
    ValidateApplication,
    RefuseApplication,
    Archive,
}

impl TransitionEvent {
    pub const ALL: [TransitionEvent; 5] = [
        TransitionEvent::SendApplication,
        TransitionEvent::ReviewApplication,
        TransitionEvent::ValidateApplication,
        TransitionEvent::RefuseApplication,
        TransitionEvent::Archive,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            TransitionEvent::SendApplication => "send_application",
            TransitionEvent::ReviewApplication => "review_application",
            TransitionEvent::ValidateApplication => "validate_application",
            TransitionEvent::RefuseApplication => "refuse_application",
            TransitionEvent::Archive => "archive",
        }
    }

    pub const fn requires_comment(self) -> bool {
        matches!(
            self,
            TransitionEvent::ReviewApplication | TransitionEvent::RefuseApplication
        )
    }

    /// Submission re-checks the applicant's identity before committing.
    pub const fn requires_identity_check(self) -> bool {
        matches!(self, TransitionEvent::SendApplication)
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tag that does not name any transition event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event '{0}'")]
pub struct UnknownEvent(pub String);

impl FromStr for TransitionEvent {
    type Err = UnknownEvent;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.name() == raw.trim())
            .ok_or_else(|| UnknownEvent(raw.to_string()))
    }
}

/// Legal outgoing edge: `event` moves any state in `from` to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub event: TransitionEvent,
    pub from: &'static [EnrollmentStatus],
    pub to: EnrollmentStatus,
}

pub const DEFAULT_EDGES: &[Edge] = &[
    Edge {
        event: TransitionEvent::SendApplication,
        from: &[EnrollmentStatus::Draft, EnrollmentStatus::Pending],
        to: EnrollmentStatus::UnderReview,
    },
    Edge {
        event: TransitionEvent::ReviewApplication,
        from: &[EnrollmentStatus::UnderReview],
        to: EnrollmentStatus::Pending,
    },
    Edge {
        event: TransitionEvent::ValidateApplication,
        from: &[EnrollmentStatus::UnderReview],
        to: EnrollmentStatus::Validated,
    },
    Edge {
        event: TransitionEvent::RefuseApplication,
        from: &[EnrollmentStatus::Pending, EnrollmentStatus::UnderReview],
        to: EnrollmentStatus::Refused,
    },
    Edge {
        event: TransitionEvent::Archive,
        from: &[EnrollmentStatus::Validated, EnrollmentStatus::Refused],
        to: EnrollmentStatus::Archived,
    },
];

/// Target state of `event` from `status` under `edges`, if the edge exists.
pub fn target(
    edges: &[Edge],
    status: EnrollmentStatus,
    event: TransitionEvent,
) -> Option<EnrollmentStatus> {
    edges
        .iter()
        .find(|edge| edge.event == event && edge.from.contains(&status))
        .map(|edge| edge.to)
}

/// Caller-supplied data accompanying a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionPayload {
    #[serde(default)]
    pub comment: Option<String>,
}

impl TransitionPayload {
    pub fn with_comment(comment: impl Into<String>) -> Self {
        Self {
            comment: Some(comment.into()),
        }
    }

    fn comment(&self) -> Option<&str> {
        self.comment
            .as_deref()
            .map(str::trim)
            .filter(|comment| !comment.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransitionError {
    #[error("event '{event}' is not permitted from state '{}'", .status.label())]
    EventNotPermitted {
        event: String,
        status: EnrollmentStatus,
    },
    #[error("a comment is required for '{0}'")]
    MissingRequiredComment(TransitionEvent),
    #[error("enrollment is incomplete: {0}")]
    ValidationFailed(ValidationErrors),
}

/// Result of a successful transition, not yet persisted.
#[derive(Debug, Clone)]
pub struct Transition {
    pub enrollment: Enrollment,
    pub event: EnrollmentEvent,
    pub notifications: Vec<NotificationIntent>,
}

/// Applies transition events to enrollments. Holds no per-enrollment state.
#[derive(Debug, Clone)]
pub struct StateMachine {
    notifications: NotificationBuilder,
}

impl StateMachine {
    pub fn new(notifications: NotificationBuilder) -> Self {
        Self { notifications }
    }

    pub fn notifications(&self) -> &NotificationBuilder {
        &self.notifications
    }

    /// Whether `event` is an outgoing edge of the enrollment's current state.
    pub fn ensure_edge(
        &self,
        enrollment: &Enrollment,
        event: TransitionEvent,
    ) -> Result<EnrollmentStatus, TransitionError> {
        let edges = variant(enrollment.provider).edges;
        target(edges, enrollment.status(), event).ok_or_else(|| {
            TransitionError::EventNotPermitted {
                event: event.name().to_string(),
                status: enrollment.status(),
            }
        })
    }

    /// Check guards and compute the next version of `enrollment`. The input is left
    /// untouched, so a failed guard never partially applies.
    pub fn apply(
        &self,
        enrollment: &Enrollment,
        event: TransitionEvent,
        actor: &Actor,
        payload: &TransitionPayload,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        let next_status = self.ensure_edge(enrollment, event)?;

        let comment = payload.comment().map(str::to_string);
        if event.requires_comment() && comment.is_none() {
            return Err(TransitionError::MissingRequiredComment(event));
        }

        if event == TransitionEvent::SendApplication {
            variant(enrollment.provider)
                .validate_submission(enrollment)
                .map_err(TransitionError::ValidationFailed)?;
        }

        let mut next = enrollment.clone();
        next.advance_to(next_status, now);
        let recorded = next.record_event(
            event.into(),
            Some(actor.user_id),
            comment.clone(),
            None,
            now,
        );
        let notifications = self.intents_for(&next, event, actor, comment.as_deref());

        Ok(Transition {
            enrollment: next,
            event: recorded,
            notifications,
        })
    }

    fn intents_for(
        &self,
        enrollment: &Enrollment,
        event: TransitionEvent,
        actor: &Actor,
        comment: Option<&str>,
    ) -> Vec<NotificationIntent> {
        let builder = &self.notifications;
        match event {
            TransitionEvent::SendApplication => vec![
                builder.to_owner(enrollment, NotificationTemplate::SendApplication, None),
                builder.to_administrators(
                    enrollment,
                    NotificationTemplate::NotifyApplicationSent,
                    &actor.email,
                ),
            ],
            TransitionEvent::ReviewApplication => vec![builder.to_owner(
                enrollment,
                NotificationTemplate::ReviewApplication,
                comment,
            )],
            TransitionEvent::RefuseApplication => vec![builder.to_owner(
                enrollment,
                NotificationTemplate::RefuseApplication,
                comment,
            )],
            TransitionEvent::ValidateApplication => {
                let mut intents = vec![builder.to_owner(
                    enrollment,
                    NotificationTemplate::ValidateApplication,
                    comment,
                )];
                intents.extend(
                    RgpdRole::ALL
                        .into_iter()
                        .filter_map(|role| builder.rgpd_contact(enrollment, role)),
                );
                intents
            }
            TransitionEvent::Archive => Vec::new(),
        }
    }
}
