pub mod acquisition;
pub mod rate;
pub mod recovery;

pub use acquisition::{AcquisitionLoop, AcquisitionState, CancellationToken, RunSummary};
pub use rate::RateEstimator;
pub use recovery::{RecoveryAction, RecoveryPolicy, RecoveryState};
