//! Local store module
//!
//! Transactional cache of every entity the signed-in user can see. The
//! schema enforces parent/child integrity so a task, member or invitation
//! can never reference a project that is not present locally.

mod rows;
pub mod schema;
pub mod sqlite;
pub mod traits;

pub use sqlite::SqliteStore;
pub use traits::{LocalStore, ReconcileReport, ReconcileScope};
