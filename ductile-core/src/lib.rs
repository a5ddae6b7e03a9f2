//! Shared types for Ductile: the error taxonomy every component returns,
//! pagination shapes, the per-request context bag, and the slug codec used
//! by the configuration API.

pub mod context;
pub mod error;
pub mod page;
pub mod slug;

pub use context::{CacheBindings, Principal, RequestContext};
pub use error::{ApiError, FieldError};
pub use page::{Page, PageParams, WriteOutcome, DEFAULT_LIMIT, MAX_LIMIT, RESERVED_PARAMS};
pub use slug::{path_to_slug, slug_to_path};
