use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::limits::MAX_ID_LEN;

/// Shared-secret login: any user name, one password. The user name becomes
/// the `created_by` of every ledger row the session writes, so it is checked
/// before the password exchange starts.
#[derive(Debug)]
pub struct SharedSecretAuth {
    password: String,
}

impl SharedSecretAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

/// The ledger identity for a login name, or why it can't be one.
pub fn ledger_identity(user: Option<&str>) -> Result<&str, String> {
    let user = user.map(str::trim).unwrap_or_default();
    if user.is_empty() {
        return Err("a user name is required".into());
    }
    if user.len() > MAX_ID_LEN {
        return Err(format!("user name longer than {MAX_ID_LEN} bytes"));
    }
    if user.chars().any(char::is_control) {
        return Err("user name contains control characters".into());
    }
    Ok(user)
}

#[async_trait]
impl AuthSource for SharedSecretAuth {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if let Err(reason) = ledger_identity(login.user()) {
            tracing::warn!("login from {} rejected: {reason}", login.host());
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                reason,
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
