use std::fmt;

use atelier_contracts::collaborators::{AuthHeaders, CredentialProvider};

/// Fixed API key sent under one header name.
#[derive(Clone)]
pub struct StaticKeyCredentials {
    header: String,
    value: String,
}

impl StaticKeyCredentials {
    pub fn bearer(api_key: impl AsRef<str>) -> Self {
        Self {
            header: "Authorization".to_string(),
            value: format!("Bearer {}", api_key.as_ref()),
        }
    }

    pub fn header(header: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            header: header.into(),
            value: api_key.into(),
        }
    }
}

impl fmt::Debug for StaticKeyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyCredentials")
            .field("header", &self.header)
            .field("value", &"<redacted>")
            .finish()
    }
}

impl CredentialProvider for StaticKeyCredentials {
    fn auth_headers(&self) -> anyhow::Result<AuthHeaders> {
        let mut headers = AuthHeaders::new();
        headers.insert(self.header.clone(), self.value.clone());
        Ok(headers)
    }
}
