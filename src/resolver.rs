//! Fallback resolver: priority order → attempt plan.
//!
//! [`resolve_order`] is pure. It reads nothing but its arguments and is
//! called exactly once per session, at the `Admitted → Uploading`
//! transition. The resulting [`AttemptPlan`] is stored on the session and
//! never re-evaluated, so a settings change made while a session is in
//! flight cannot alter that session's attempt sequence.
//!
//! ```text
//! priority ids ──▶ drop unknown / incapable / duplicate ──▶ non-empty? ──▶ plan
//!                                                             │ no
//!                                                             ▼
//!                                                  catalog default order
//! ```

use crate::catalog::{OperationFamily, TechnologyCatalog, TechnologyDescriptor, TechnologyId};
use crate::error::DocOpsError;
use serde::{Deserialize, Serialize};

/// Where the attempt order came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrigin {
    /// The stored priority list (possibly filtered).
    Priority,
    /// The priority list filtered to nothing; catalog default used instead.
    CatalogDefault,
}

/// The ordered technologies a session will try, frozen at session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptPlan {
    family: OperationFamily,
    candidates: Vec<TechnologyDescriptor>,
    origin: PlanOrigin,
    /// Priority entries the catalog no longer backs.
    dropped: Vec<TechnologyId>,
}

impl AttemptPlan {
    /// A plan with no candidates, for a family nothing can serve.
    pub(crate) fn empty(family: OperationFamily, dropped: Vec<TechnologyId>) -> Self {
        Self {
            family,
            candidates: Vec::new(),
            origin: PlanOrigin::CatalogDefault,
            dropped,
        }
    }

    pub fn family(&self) -> &OperationFamily {
        &self.family
    }

    pub fn candidates(&self) -> &[TechnologyDescriptor] {
        &self.candidates
    }

    pub fn get(&self, attempt_index: usize) -> Option<&TechnologyDescriptor> {
        self.candidates.get(attempt_index)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn ids(&self) -> Vec<TechnologyId> {
        self.candidates.iter().map(|t| t.id.clone()).collect()
    }

    pub fn origin(&self) -> PlanOrigin {
        self.origin
    }

    pub fn dropped(&self) -> &[TechnologyId] {
        &self.dropped
    }
}

/// Produce the ordered attempt sequence for `family`.
///
/// Priority entries whose descriptor is missing or no longer advertises
/// `family` are dropped. If that empties the list, the catalog's default
/// ordering is used. Fails only when the catalog has no capable technology
/// at all.
pub fn resolve_order(
    catalog: &TechnologyCatalog,
    family: &OperationFamily,
    priority: &[TechnologyId],
) -> Result<AttemptPlan, DocOpsError> {
    let mut candidates: Vec<TechnologyDescriptor> = Vec::with_capacity(priority.len());
    let mut dropped = Vec::new();

    for id in priority {
        match catalog.technology(id) {
            Some(tech) if tech.supports(family) && !candidates.iter().any(|c| &c.id == id) => {
                candidates.push(tech.clone())
            }
            _ => dropped.push(id.clone()),
        }
    }

    let origin = if candidates.is_empty() {
        candidates = catalog
            .default_order(family)
            .iter()
            .filter_map(|id| catalog.technology(id).cloned())
            .collect();
        PlanOrigin::CatalogDefault
    } else {
        PlanOrigin::Priority
    };

    if candidates.is_empty() {
        return Err(DocOpsError::UnknownFamily(family.to_string()));
    }

    Ok(AttemptPlan {
        family: family.clone(),
        candidates,
        origin,
        dropped,
    })
}
