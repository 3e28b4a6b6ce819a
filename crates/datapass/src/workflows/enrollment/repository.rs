use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::domain::{Enrollment, EnrollmentId};

/// Storage abstraction so the workflow can be exercised in isolation.
///
/// `update` is optimistic: the stored revision must equal the revision the record was
/// loaded at, otherwise the write is refused with `StaleRevision`.
pub trait EnrollmentRepository: Send + Sync {
    fn insert(&self, enrollment: Enrollment) -> Result<Enrollment, RepositoryError>;
    fn update(&self, enrollment: Enrollment) -> Result<Enrollment, RepositoryError>;
    fn fetch(&self, id: EnrollmentId) -> Result<Option<Enrollment>, RepositoryError>;
    /// Removes the record together with its events and documents.
    fn delete(&self, id: EnrollmentId) -> Result<(), RepositoryError>;
    fn matching(
        &self,
        predicate: &(dyn Fn(&Enrollment) -> bool + Sync),
    ) -> Result<Vec<Enrollment>, RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("record was modified concurrently (expected revision {expected}, found {found})")]
    StaleRevision { expected: u64, found: u64 },
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Process-local repository used by the service binary and the tests.
#[derive(Default, Clone)]
pub struct InMemoryEnrollmentRepository {
    records: Arc<Mutex<HashMap<EnrollmentId, Enrollment>>>,
}

impl InMemoryEnrollmentRepository {
    fn records(&self) -> MutexGuard<'_, HashMap<EnrollmentId, Enrollment>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }
}

impl EnrollmentRepository for InMemoryEnrollmentRepository {
    fn insert(&self, mut enrollment: Enrollment) -> Result<Enrollment, RepositoryError> {
        let mut guard = self.records();
        if guard.contains_key(&enrollment.id) {
            return Err(RepositoryError::Conflict);
        }
        enrollment.bump_revision();
        guard.insert(enrollment.id, enrollment.clone());
        Ok(enrollment)
    }

    fn update(&self, mut enrollment: Enrollment) -> Result<Enrollment, RepositoryError> {
        let mut guard = self.records();
        let stored = guard
            .get(&enrollment.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.revision() != enrollment.revision() {
            return Err(RepositoryError::StaleRevision {
                expected: enrollment.revision(),
                found: stored.revision(),
            });
        }
        enrollment.bump_revision();
        guard.insert(enrollment.id, enrollment.clone());
        Ok(enrollment)
    }

    fn fetch(&self, id: EnrollmentId) -> Result<Option<Enrollment>, RepositoryError> {
        Ok(self.records().get(&id).cloned())
    }

    fn delete(&self, id: EnrollmentId) -> Result<(), RepositoryError> {
        self.records()
            .remove(&id)
            .map(|_| ())
            .ok_or(RepositoryError::NotFound)
    }

    fn matching(
        &self,
        predicate: &(dyn Fn(&Enrollment) -> bool + Sync),
    ) -> Result<Vec<Enrollment>, RepositoryError> {
        Ok(self
            .records()
            .values()
            .filter(|enrollment| predicate(enrollment))
            .cloned()
            .collect())
    }
}
