//! Repository layer: entity-scoped database operations over a borrowed
//! connection. Models go in, models come out; records stay internal.

mod analysis;
mod document;
mod output;
mod rules;
mod schema;

pub use analysis::*;
pub use document::*;
pub use output::*;
pub use rules::*;
pub use schema::*;
