use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{Enrollment, EnrollmentId, EnrollmentStatus, Provider};

pub const MAX_PAGE_SIZE: usize = 100;
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Filters over the allow-listed fields. Text filters on names are fuzzy
/// (case-insensitive substring), identifiers match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ListFilters {
    pub status: Option<EnrollmentStatus>,
    pub provider: Option<Provider>,
    pub siret: Option<String>,
    pub legal_name: Option<String>,
    pub title: Option<String>,
    pub owner_email: Option<String>,
    /// Archived enrollments are hidden unless asked for.
    pub archived: bool,
}

fn fuzzy(haystack: Option<&str>, needle: &str) -> bool {
    haystack.is_some_and(|value| {
        value
            .to_lowercase()
            .contains(&needle.trim().to_lowercase())
    })
}

impl ListFilters {
    pub fn matches(&self, enrollment: &Enrollment) -> bool {
        let status = enrollment.status();
        if !self.archived && status == EnrollmentStatus::Archived {
            return false;
        }
        if self.archived && self.status.is_none() && status != EnrollmentStatus::Archived {
            return false;
        }
        if self.status.is_some_and(|wanted| wanted != status) {
            return false;
        }
        if self.provider.is_some_and(|wanted| wanted != enrollment.provider) {
            return false;
        }
        if let Some(siret) = &self.siret {
            if enrollment.siret.as_deref().map(str::trim) != Some(siret.trim()) {
                return false;
            }
        }
        if let Some(needle) = &self.legal_name {
            if !fuzzy(enrollment.legal_name.as_deref(), needle) {
                return false;
            }
        }
        if let Some(needle) = &self.title {
            if !fuzzy(enrollment.content.title.as_deref(), needle) {
                return false;
            }
        }
        if let Some(needle) = &self.owner_email {
            if !fuzzy(Some(&enrollment.owner.email), needle) {
                return false;
            }
        }
        true
    }
}

/// Sort direction on `updated_at`, the only sortable key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Zero-based page index.
    pub page: usize,
    pub size: usize,
}

impl PageRequest {
    pub fn new(page: usize, size: usize) -> Self {
        Self {
            page,
            size: size.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, DEFAULT_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageMeta {
    pub page: usize,
    pub size: usize,
    pub total_items: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub meta: PageMeta,
}

/// Sort by `updated_at` then slice out the requested page, projected to `T`.
pub fn paginate<T>(
    mut enrollments: Vec<Enrollment>,
    sort: SortDirection,
    request: PageRequest,
) -> Page<T>
where
    T: for<'a> From<&'a Enrollment>,
{
    enrollments.sort_by(|left, right| {
        let ordering = left
            .updated_at
            .cmp(&right.updated_at)
            .then(left.id.cmp(&right.id));
        match sort {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        }
    });

    let total_items = enrollments.len();
    let total_pages = total_items.div_ceil(request.size);
    let items = enrollments
        .iter()
        .skip(request.page.saturating_mul(request.size))
        .take(request.size)
        .map(T::from)
        .collect();

    Page {
        items,
        meta: PageMeta {
            page: request.page,
            size: request.size,
            total_items,
            total_pages,
        },
    }
}

/// Row shown in listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollmentSummary {
    pub id: EnrollmentId,
    pub provider: Provider,
    pub status: &'static str,
    pub title: Option<String>,
    pub siret: Option<String>,
    pub legal_name: Option<String>,
    pub owner_email: String,
    pub updated_at: DateTime<Utc>,
}

impl From<&Enrollment> for EnrollmentSummary {
    fn from(enrollment: &Enrollment) -> Self {
        Self {
            id: enrollment.id,
            provider: enrollment.provider,
            status: enrollment.status().label(),
            title: enrollment.content.title.clone(),
            siret: enrollment.siret.clone(),
            legal_name: enrollment.legal_name.clone(),
            owner_email: enrollment.owner.email.clone(),
            updated_at: enrollment.updated_at,
        }
    }
}

/// Reduced projection of a validated enrollment, readable without authentication.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicEnrollmentView {
    pub id: EnrollmentId,
    pub provider: Provider,
    pub title: Option<String>,
    pub legal_name: Option<String>,
    pub siret: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Enrollment> for PublicEnrollmentView {
    fn from(enrollment: &Enrollment) -> Self {
        Self {
            id: enrollment.id,
            provider: enrollment.provider,
            title: enrollment.content.title.clone(),
            legal_name: enrollment.legal_name.clone(),
            siret: enrollment.siret.clone(),
            updated_at: enrollment.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::enrollment::domain::{OrganizationId, UserId, UserRef};
    use chrono::Duration;

    fn enrollment(id: u64, legal_name: &str, minutes: i64) -> Enrollment {
        let now = Utc::now();
        let mut enrollment = Enrollment::draft(
            EnrollmentId(id),
            Provider::ApiParticulier,
            UserRef {
                id: UserId(1),
                email: "agent@ville.fr".to_string(),
            },
            OrganizationId(1),
            now,
        );
        enrollment.legal_name = Some(legal_name.to_string());
        enrollment.updated_at = now + Duration::minutes(minutes);
        enrollment
    }

    #[test]
    fn page_size_is_capped() {
        assert_eq!(PageRequest::new(0, 500).size, MAX_PAGE_SIZE);
        assert_eq!(PageRequest::new(0, 0).size, 1);
    }

    #[test]
    fn legal_name_filter_is_case_insensitive() {
        let filters = ListFilters {
            legal_name: Some("lyon".to_string()),
            ..ListFilters::default()
        };
        assert!(filters.matches(&enrollment(1, "Mairie de LYON", 0)));
        assert!(!filters.matches(&enrollment(2, "Mairie de Brest", 0)));
    }

    #[test]
    fn paginate_sorts_by_update_time() {
        let records = vec![
            enrollment(1, "A", 0),
            enrollment(2, "B", 10),
            enrollment(3, "C", 5),
        ];

        let page: Page<EnrollmentSummary> =
            paginate(records, SortDirection::Desc, PageRequest::new(0, 2));
        let ids: Vec<u64> = page.items.iter().map(|item| item.id.0).collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(page.meta.total_items, 3);
        assert_eq!(page.meta.total_pages, 2);
    }
}
