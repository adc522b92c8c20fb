//! Transaction submission: gas limits, pending request handles and the submitter

mod gas;
mod request;
mod submitter;

pub use gas::GasMetrics;
pub use request::{PendingRequest, Rejection, RequestNotifier};
pub use submitter::OperationSubmitter;
