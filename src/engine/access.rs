use ulid::Ulid;

use crate::model::Principal;

use super::EngineError;

/// Staff always pass; anyone else only for bookings they own.
pub fn can_access(actor: &Principal, owner: Ulid) -> bool {
    actor.role.is_staff() || actor.id == owner
}

pub fn ensure_access(
    actor: &Principal,
    owner: Ulid,
    msg: &'static str,
) -> Result<(), EngineError> {
    if can_access(actor, owner) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(msg))
    }
}

pub fn require_staff(actor: &Principal, msg: &'static str) -> Result<(), EngineError> {
    if actor.role.is_staff() {
        Ok(())
    } else {
        Err(EngineError::Forbidden(msg))
    }
}
