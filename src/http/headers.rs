//! Header construction shared by all adapters.

use crate::error::LlmError;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, USER_AGENT,
};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct HttpHeaderBuilder {
    headers: HeaderMap,
}

fn header_name(name: &str) -> Result<HeaderName, LlmError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| LlmError::ConfigurationError(format!("Invalid header name '{name}': {e}")))
}

/// Credential-bearing value; marked sensitive so it is redacted from `Debug` output.
fn secret_value(value: &str) -> Result<HeaderValue, LlmError> {
    let mut v = HeaderValue::from_str(value)
        .map_err(|e| LlmError::ConfigurationError(format!("Invalid credential format: {e}")))?;
    v.set_sensitive(true);
    Ok(v)
}

impl HttpHeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bearer_auth(mut self, token: &SecretString) -> Result<Self, LlmError> {
        let value = secret_value(&format!("Bearer {}", token.expose_secret()))?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(self)
    }

    /// Non-standard auth header such as `x-api-key` or `x-goog-api-key`.
    pub fn with_custom_auth(mut self, name: &str, token: &SecretString) -> Result<Self, LlmError> {
        let value = secret_value(token.expose_secret())?;
        self.headers.insert(header_name(name)?, value);
        Ok(self)
    }

    pub fn with_json_content_type(mut self) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self
    }

    pub fn with_accept(mut self, accept: &'static str) -> Self {
        self.headers.insert(ACCEPT, HeaderValue::from_static(accept));
        self
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Result<Self, LlmError> {
        self.headers.insert(
            USER_AGENT,
            HeaderValue::from_str(user_agent)
                .map_err(|e| LlmError::ConfigurationError(format!("Invalid user agent: {e}")))?,
        );
        Ok(self)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, LlmError> {
        self.headers.insert(
            header_name(name)?,
            HeaderValue::from_str(value).map_err(|e| {
                LlmError::ConfigurationError(format!("Invalid header value for '{name}': {e}"))
            })?,
        );
        Ok(self)
    }

    pub fn with_custom_headers(
        mut self,
        custom_headers: &HashMap<String, String>,
    ) -> Result<Self, LlmError> {
        for (key, value) in custom_headers {
            self = self.with_header(key, value)?;
        }
        Ok(self)
    }

    pub fn build(self) -> HeaderMap {
        self.headers
    }
}

/// Overlay `extra` onto `base`; entries in `extra` win.
pub fn merge_headers(mut base: HeaderMap, extra: &HeaderMap) -> HeaderMap {
    for (k, v) in extra {
        base.insert(k.clone(), v.clone());
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_is_sensitive() {
        let headers = HttpHeaderBuilder::new()
            .with_bearer_auth(&SecretString::from("sk-123"))
            .unwrap()
            .with_json_content_type()
            .build();
        let auth = headers.get(AUTHORIZATION).unwrap();
        assert_eq!(auth.to_str().unwrap(), "Bearer sk-123");
        assert!(auth.is_sensitive());
        assert!(!format!("{headers:?}").contains("sk-123"));
    }

    #[test]
    fn invalid_header_name_is_configuration_error() {
        let err = HttpHeaderBuilder::new().with_header("bad header", "v").unwrap_err();
        assert!(matches!(err, LlmError::ConfigurationError(_)));
    }

    #[test]
    fn merge_overrides() {
        let base = HttpHeaderBuilder::new().with_header("a", "1").unwrap().build();
        let extra = HttpHeaderBuilder::new().with_header("a", "2").unwrap().build();
        assert_eq!(merge_headers(base, &extra).get("a").unwrap(), "2");
    }
}
