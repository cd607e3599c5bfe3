//! Password-based SSH authentication.

use async_trait::async_trait;
use russh::client;
use zeroize::Zeroizing;

use crate::broker::transport::ssh::SshClientHandler;

use super::traits::AuthStrategy;

/// Password authentication strategy. The password is wiped on drop.
pub struct PasswordAuth {
    password: Zeroizing<String>,
}

impl PasswordAuth {
    pub fn new(password: Zeroizing<String>) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let result = handle
            .authenticate_password(username, self.password.as_str())
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_auth_name() {
        let auth = PasswordAuth::new(Zeroizing::new("secret".to_string()));
        assert_eq!(auth.name(), "password");
    }

    #[test]
    fn test_password_auth_keeps_secret() {
        let auth = PasswordAuth::new(Zeroizing::new("my-password".to_string()));
        assert_eq!(auth.password.as_str(), "my-password");
    }
}
