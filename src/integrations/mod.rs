//! External service integrations.

pub mod bureau_client {
    pub use crate::bureau_client::*;
}

pub mod circuit_breaker {
    pub use crate::circuit_breaker::*;
}
