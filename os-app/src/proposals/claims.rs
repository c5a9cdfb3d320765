use crate::proposals::model::ProposalId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;

/// Per-process registry of proposals a handler is currently working on.
#[derive(Clone, Default)]
pub struct InFlightClaims {
    inner: Arc<DashMap<ProposalId, ()>>,
}

impl InFlightClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` while another holder has the id.
    pub fn try_claim(&self, id: ProposalId) -> Option<ClaimGuard> {
        match self.inner.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(ClaimGuard {
                    id,
                    inner: self.inner.clone(),
                })
            }
        }
    }
}

/// Releases the claim when dropped.
pub struct ClaimGuard {
    id: ProposalId,
    inner: Arc<DashMap<ProposalId, ()>>,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.inner.remove(&self.id);
    }
}
