//! Entity metadata, keys and handles.

mod handle;
mod key;
mod metadata;

pub use handle::{Entity, EntityRef};
pub use key::{CacheKey, DeflatedPredicate, PrimaryKey};
pub use metadata::{EntityType, EntityTypeBuilder, KeyComponent};
