use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::warn;

use crate::engine::Engine;
use crate::observability;
use crate::wire::lookup_principal;

/// Shared-password auth plus an identity check: the login name must be the
/// id of a registered, active user.
pub struct CarHireAuthSource {
    engine: Arc<Engine>,
    password: String,
}

impl CarHireAuthSource {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self { engine, password }
    }
}

impl fmt::Debug for CarHireAuthSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CarHireAuthSource")
            .field("password", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthSource for CarHireAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if let Err(msg) = lookup_principal(&self.engine, login.user()) {
            warn!("rejected login: {msg}");
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                msg,
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
