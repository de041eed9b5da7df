//! Authorization gate and login throttling.

pub mod guard;
pub mod rate_limit;

pub use guard::{check_principal, require_session};
pub use rate_limit::LoginThrottle;
