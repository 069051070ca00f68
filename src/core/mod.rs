// Domain-layer modules and shared errors/models
pub mod coordinator {
    pub use crate::coordinator::*;
}

pub mod retry_queue {
    pub use crate::retry_queue::*;
}

pub mod services {
    pub use crate::services::*;
}

pub mod tiering {
    pub use crate::tiering::*;
}

pub mod usage {
    pub use crate::usage::*;
}

pub mod models {
    pub use crate::models::*;
}

pub mod errors {
    pub use crate::errors::*;
}
