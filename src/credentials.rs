use std::fmt;

use crate::error::PipelineError;

pub const PUBLIC_ID_VAR: &str = "NUMERAI_PUBLIC_ID";
pub const SECRET_KEY_VAR: &str = "NUMERAI_SECRET_KEY";
pub const MODEL_ID_VAR: &str = "NUMERAI_MODEL_ID";

#[derive(Clone, Default)]
pub struct Credentials {
    public_id: Option<String>,
    secret_key: Option<String>,
    model_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialPresence {
    pub public_id: bool,
    pub secret_key: bool,
    pub model_id: bool,
}

/// Public id + secret key pair sent as the `Authorization` header.
#[derive(Clone)]
pub struct ApiKey {
    public_id: String,
    secret_key: String,
}

#[derive(Debug, Clone)]
pub struct SubmissionCredentials {
    pub key: ApiKey,
    pub model_id: String,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            public_id: read(PUBLIC_ID_VAR),
            secret_key: read(SECRET_KEY_VAR),
            model_id: read(MODEL_ID_VAR),
        }
    }

    pub fn public_id(&self) -> Option<&str> {
        self.public_id.as_deref()
    }

    pub fn model_id(&self) -> Option<&str> {
        self.model_id.as_deref()
    }

    pub fn presence(&self) -> CredentialPresence {
        CredentialPresence {
            public_id: self.public_id.is_some(),
            secret_key: self.secret_key.is_some(),
            model_id: self.model_id.is_some(),
        }
    }

    pub fn api_key(&self) -> Option<ApiKey> {
        match (&self.public_id, &self.secret_key) {
            (Some(public_id), Some(secret_key)) => Some(ApiKey {
                public_id: public_id.clone(),
                secret_key: secret_key.clone(),
            }),
            _ => None,
        }
    }

    pub fn require_all(&self) -> Result<SubmissionCredentials, PipelineError> {
        let mut missing = Vec::new();
        if self.public_id.is_none() {
            missing.push(PUBLIC_ID_VAR);
        }
        if self.secret_key.is_none() {
            missing.push(SECRET_KEY_VAR);
        }
        if self.model_id.is_none() {
            missing.push(MODEL_ID_VAR);
        }
        match (self.api_key(), self.model_id.clone()) {
            (Some(key), Some(model_id)) if missing.is_empty() => {
                Ok(SubmissionCredentials { key, model_id })
            }
            _ => Err(PipelineError::MissingCredentials(missing)),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("public_id", &self.public_id)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "[hidden]"))
            .field("model_id", &self.model_id)
            .finish()
    }
}

impl ApiKey {
    pub fn new(public_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            public_id: public_id.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn authorization_header(&self) -> String {
        format!("Token {}${}", self.public_id, self.secret_key)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("public_id", &self.public_id)
            .field("secret_key", &"[hidden]")
            .finish()
    }
}
