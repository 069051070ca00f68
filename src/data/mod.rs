//! Persistence layer: the store trait and its Postgres and in-memory backends.

pub mod store {
    pub use crate::store::*;
}

pub mod db {
    pub use crate::db::*;
}

pub mod db_storage {
    pub use crate::db_storage::*;
}

pub mod memory_store {
    pub use crate::memory_store::*;
}

pub mod cache_validator {
    pub use crate::cache_validator::*;
}
