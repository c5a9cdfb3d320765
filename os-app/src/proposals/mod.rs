//! Proposal approval: an agent proposes a calendar event, a human decides,
//! and the calendar write happens at most once.

pub mod approval;
pub mod claims;
pub mod model;
pub mod router;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use approval::ApprovalPresenter;
pub use claims::InFlightClaims;
pub use model::{EventProposal, ProposalId, ProposalStatus};
pub use router::{CallbackOutcome, CallbackRouter};
pub use service::{ProposalService, SubmitError};
pub use store::{ProposalStore, SqliteProposalStore, StoreError};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use validator::{ProposalRequest, ProposalValidator, ValidationError};
