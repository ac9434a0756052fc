//! The hardening passes and the [`Pass`] trait they implement

mod cdla;
mod gdlr;
mod icall;
mod lgpromote;
mod pass;
mod verify;

pub use cdla::{
    is_really_address_taken,
    CdlaError,
    LeakageAnalysisPass,
    LeakageStatistics,
    SpillAnalysis,
    Statistics,
};
pub use gdlr::{
    GdlrError,
    LayoutRandomizerPass,
    LayoutStatistics,
    StorageClass,
    DECOY_BLOCK_SIZE,
    DECOY_PREFIX,
    GUARD_FUNCTION,
};
pub use icall::{
    ICallError,
    ICallLimiterPass,
};
pub use lgpromote::{
    PromoteError,
    PromotePass,
    PromotionStatistics,
    SENTINEL_BYTE,
};
pub use pass::Pass;
pub use verify::{
    VerifyError,
    VerifyPass,
};
