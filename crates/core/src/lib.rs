//! kade core types: resource model, object identity, path language,
//! matchers, config document, change ops and the error taxonomy.

#![forbid(unsafe_code)]

pub mod annotations;
pub mod change;
pub mod config;
pub mod duration;
pub mod error;
pub mod matcher;
pub mod path;
pub mod resource;
pub mod ui;

pub use change::{ChangeOp, OpStrategy};
pub use config::{parse_yaml, Config};
pub use duration::parse_duration;
pub use error::{ErrorKind, KadeError, KadeResult, MultiError};
pub use matcher::{any_matches, ResourceMatcher};
pub use path::{Path, PathSegment, Step};
pub use resource::{canonical_yaml, ObjectKey, OwnerRef, Resource, ResourceRef};
pub use ui::{RecordingUi, TracingUi, UiSink};

pub mod prelude {
    pub use super::{ChangeOp, Config, KadeError, KadeResult, ObjectKey, OpStrategy, Resource, ResourceRef, UiSink};
}
