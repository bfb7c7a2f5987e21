use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Cleartext password check. Every login shares one password except the admin
/// user, who may be given its own.
#[derive(Debug, Clone)]
pub struct SlotbookAuthSource {
    password: String,
    admin_user: String,
    admin_password: Option<String>,
}

impl SlotbookAuthSource {
    pub fn new(password: String, admin_user: String, admin_password: Option<String>) -> Self {
        Self {
            password,
            admin_user,
            admin_password,
        }
    }

    /// The password `user` must present.
    pub fn expected_password(&self, user: Option<&str>) -> &str {
        match (&self.admin_password, user) {
            (Some(admin_pw), Some(u)) if u == self.admin_user => admin_pw,
            _ => &self.password,
        }
    }

    pub fn is_admin(&self, user: Option<&str>) -> bool {
        user == Some(self.admin_user.as_str())
    }
}

#[async_trait]
impl AuthSource for SlotbookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let expected = self.expected_password(login.user());
        Ok(Password::new(None, expected.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_gets_own_password_when_configured() {
        let auth = SlotbookAuthSource::new("shared".into(), "admin".into(), Some("root".into()));
        assert_eq!(auth.expected_password(Some("admin")), "root");
        assert_eq!(auth.expected_password(Some("alice")), "shared");
        assert_eq!(auth.expected_password(None), "shared");
    }

    #[test]
    fn admin_falls_back_to_shared_password() {
        let auth = SlotbookAuthSource::new("shared".into(), "admin".into(), None);
        assert_eq!(auth.expected_password(Some("admin")), "shared");
        assert!(auth.is_admin(Some("admin")));
        assert!(!auth.is_admin(Some("alice")));
        assert!(!auth.is_admin(None));
    }
}
