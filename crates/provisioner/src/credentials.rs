//! Cloud credentials injected by the pipeline.

use crate::error::{ProvisionError, Result};

/// Environment variable holding the access key id.
pub const ACCESS_KEY_ID_VAR: &str = "AWS_ACCESS_KEY_ID";
/// Environment variable holding the secret access key.
pub const SECRET_ACCESS_KEY_VAR: &str = "AWS_SECRET_ACCESS_KEY";

/// Static cloud credentials.
///
/// Kept in memory only. Not serializable, and redacted in debug output.
#[derive(Clone)]
pub struct PipelineCredentials {
    access_key_id: String,
    secret_access_key: String,
}

impl PipelineCredentials {
    /// Build from explicit values.
    #[must_use]
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    /// Read from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `MissingCredentials` naming the first unset variable.
    pub fn from_env() -> Result<Self> {
        let read = |name: &'static str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or(ProvisionError::MissingCredentials(name))
        };
        Ok(Self {
            access_key_id: read(ACCESS_KEY_ID_VAR)?,
            secret_access_key: read(SECRET_ACCESS_KEY_VAR)?,
        })
    }

    /// Access key id.
    #[must_use]
    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    /// Variables to set on child processes.
    #[must_use]
    pub fn env_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            (ACCESS_KEY_ID_VAR, self.access_key_id.clone()),
            (SECRET_ACCESS_KEY_VAR, self.secret_access_key.clone()),
        ]
    }
}

impl std::fmt::Debug for PipelineCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let visible: String = self.access_key_id.chars().take(4).collect();
        f.debug_struct("PipelineCredentials")
            .field("access_key_id", &format!("{visible}****"))
            .field("secret_access_key", &"****")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_debug_redacts_secret() {
        let creds = PipelineCredentials::new("AKIAEXAMPLE", "very-secret");
        let debug = format!("{creds:?}");
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("AKIAEXAMPLE"));
        assert!(debug.contains("AKIA****"));
    }

    #[test]
    #[serial]
    fn test_from_env_requires_both_variables() {
        std::env::set_var(ACCESS_KEY_ID_VAR, "AKIAEXAMPLE");
        std::env::remove_var(SECRET_ACCESS_KEY_VAR);
        let err = PipelineCredentials::from_env().unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::MissingCredentials(SECRET_ACCESS_KEY_VAR)
        ));

        std::env::set_var(SECRET_ACCESS_KEY_VAR, "secret");
        let creds = PipelineCredentials::from_env().unwrap();
        assert_eq!(creds.access_key_id(), "AKIAEXAMPLE");
        assert_eq!(creds.env_pairs().len(), 2);

        std::env::remove_var(ACCESS_KEY_ID_VAR);
        std::env::remove_var(SECRET_ACCESS_KEY_VAR);
    }
}
