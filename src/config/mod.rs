pub mod builder;
pub mod loader;
pub mod schema;

pub use builder::PatchBuilder;
pub use loader::{load_from_path, load_from_str, ConfigError, Format, PatchLoader};
pub use schema::{
    Params, PatchDocument, PatchKindName, ReplacementDef, ValidationError, ValidationIssue,
};
