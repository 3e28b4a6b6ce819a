use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::domain::{Enrollment, Field, UserId};
use super::state_machine::TransitionEvent;

/// Name recorded on an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Created,
    Updated,
    SendApplication,
    ReviewApplication,
    ValidateApplication,
    RefuseApplication,
    Archive,
}

impl EventName {
    pub const fn label(self) -> &'static str {
        match self {
            EventName::Created => "created",
            EventName::Updated => "updated",
            EventName::SendApplication => "send_application",
            EventName::ReviewApplication => "review_application",
            EventName::ValidateApplication => "validate_application",
            EventName::RefuseApplication => "refuse_application",
            EventName::Archive => "archive",
        }
    }
}

impl From<TransitionEvent> for EventName {
    fn from(event: TransitionEvent) -> Self {
        match event {
            TransitionEvent::SendApplication => EventName::SendApplication,
            TransitionEvent::ReviewApplication => EventName::ReviewApplication,
            TransitionEvent::ValidateApplication => EventName::ValidateApplication,
            TransitionEvent::RefuseApplication => EventName::RefuseApplication,
            TransitionEvent::Archive => EventName::Archive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// Before/after values keyed by field name.
pub type FieldDiff = BTreeMap<String, FieldChange>;

/// Immutable audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentEvent {
    pub id: u64,
    pub name: EventName,
    pub user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<FieldDiff>,
    pub created_at: DateTime<Utc>,
}

/// Append-only history owned by an enrollment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventLog {
    entries: Vec<EnrollmentEvent>,
}

impl EventLog {
    pub(crate) fn record(
        &mut self,
        name: EventName,
        user_id: Option<UserId>,
        comment: Option<String>,
        diff: Option<FieldDiff>,
        now: DateTime<Utc>,
    ) -> EnrollmentEvent {
        let event = EnrollmentEvent {
            id: self.entries.len() as u64 + 1,
            name,
            user_id,
            comment,
            diff,
            created_at: now,
        };
        self.entries.push(event.clone());
        event
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnrollmentEvent> {
        self.entries.iter()
    }

    pub fn last(&self) -> Option<&EnrollmentEvent> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn named(&self, name: EventName) -> impl Iterator<Item = &EnrollmentEvent> {
        self.entries.iter().filter(move |event| event.name == name)
    }
}

/// Compare `fields` between two versions of a record, keeping only real changes.
pub fn diff_fields(before: &Enrollment, after: &Enrollment, fields: &BTreeSet<Field>) -> FieldDiff {
    fields
        .iter()
        .filter_map(|field| {
            let old = before.field_value(*field);
            let new = after.field_value(*field);
            (old != new).then(|| (field.name().to_string(), FieldChange { old, new }))
        })
        .collect()
}
