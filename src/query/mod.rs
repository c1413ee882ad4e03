//! Query specifications and execution for shelfscan.
//!
//! This module holds the declarative query model (filters and the tagged
//! [`QuerySpec`] variants), the report plan, and the runner that dispatches
//! specs to a [`DocumentStore`](crate::db::DocumentStore).

mod filter;
pub mod plan;
pub mod runner;
mod spec;

pub use filter::{CompareOp, Filter};
pub use plan::{default_plan, load_plan};
pub use runner::{collect_report, execute, run, LabeledOutput};
pub use spec::{
    validate_field, Accumulator, BucketSpec, FilterSpec, FindQuery, GroupSpec, IndexKey,
    IndexSpec, PageSpec, Projection, QueryKind, QuerySpec, SortDirection, SortSpec, ID_FIELD,
    ID_INDEX_NAME, MAX_INDEX_NAME_LEN,
};
