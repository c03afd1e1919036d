//! Store access.  Runtime queries only; every row type maps by column name.

pub mod events;
pub mod meta;
pub mod points;
pub mod reports;
pub mod sessions;
