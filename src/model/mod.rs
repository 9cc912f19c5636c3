pub mod access;
pub mod dispatch;
pub mod settings;
pub mod unit;
pub mod user;

pub use access::{AccessLevel, UnitAccess};
pub use dispatch::{
    Dispatch, DispatchAssignment, DispatchAttribute, DispatchReference, DispatchStatus,
    DispatchStatusInput, DispatchStatusKind, ReferenceType,
};
pub use settings::{CentrumMode, CentrumSettings, JobDisponents};
pub use unit::{Unit, UnitAttribute, UnitStatus, UnitStatusInput, UnitStatusKind, UserUnitMapping};
pub use user::{UserInfo, UserMarker, UserProfile};
