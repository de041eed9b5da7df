//! The gate every non-`presence` request passes before its handler runs.
//!
//! The caller hands in the session bound to the sending connection (if any)
//! and the principal the request claims to act for.

use parley_core::{ParleyError, ParleyResult};

/// The connection must have completed login.
pub fn require_session(session: Option<&str>) -> ParleyResult<&str> {
    session.ok_or_else(|| ParleyError::Unauthorized("not logged in".into()))
}

/// The request's declared principal must be the logged-in user.
///
/// `principal == None` means the request is not tied to a principal
/// (e.g. a public key lookup) and passes.
pub fn check_principal(session: &str, principal: Option<&str>) -> ParleyResult<()> {
    match principal {
        Some(claimed) if claimed != session => Err(ParleyError::Unauthorized(format!(
            "{session} tried to act as {claimed}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_session_is_unauthorized() {
        assert!(matches!(
            require_session(None),
            Err(ParleyError::Unauthorized(_))
        ));
        assert_eq!(require_session(Some("alice")).unwrap(), "alice");
    }

    #[test]
    fn principal_must_match() {
        assert!(check_principal("alice", Some("alice")).is_ok());
        assert!(check_principal("alice", None).is_ok());
        assert!(matches!(
            check_principal("alice", Some("bob")),
            Err(ParleyError::Unauthorized(_))
        ));
    }
}
