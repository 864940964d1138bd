pub mod app;
pub mod params;
pub mod query;

pub use params::QueryParams;
pub use query::{
    handle_match_with_tenant, handle_passthrough, handle_query_with_tenant, QueryConvention,
    DEFAULT_MATCH_SELECTOR, FREE_FORM, SELECTOR_LIST,
};
