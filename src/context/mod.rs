//! Routing context: the identifier + title an external producer says the
//! next downloads belong to, and the folder name derived from them.

pub mod normalize;
mod payload;
mod store;

pub use normalize::{folder_name, normalize};
pub(crate) use payload::has_defect_prefix;
pub use payload::{ContextPayload, DEFECT_ID_PREFIX, UNKNOWN_ID};
pub use store::{ContextEvent, ContextStore, RoutingContext};
