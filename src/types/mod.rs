mod models;
mod permission;

pub use models::*;
pub use permission::Permission;
