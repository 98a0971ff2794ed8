/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use base64::prelude::*;

use super::AuthError;
use super::challenge::{param, parse_params};

#[derive(Default)]
pub struct BasicAuth {
    realm: String,
    header: String,
}

impl BasicAuth {
    pub fn set_challenge(&mut self, params_raw: &str) -> Result<(), AuthError> {
        let params = parse_params(params_raw);
        self.realm = param(&params, "realm").unwrap_or("").to_string();
        self.header.clear();
        Ok(())
    }

    pub fn generate_response(&mut self, username: &str, password: &str) -> Result<(), AuthError> {
        if username.is_empty() && password.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        self.header = format!(
            "Basic {}\r\n",
            BASE64_STANDARD.encode(format!("{username}:{password}"))
        );
        Ok(())
    }

    pub fn header_fragment(&self) -> &str {
        &self.header
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_vector() {
        let mut auth = BasicAuth::default();
        auth.set_challenge("realm=\"WallyWorld\"").unwrap();
        auth.generate_response("Aladdin", "open sesame").unwrap();
        assert_eq!(
            auth.header_fragment(),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==\r\n"
        );
        assert_eq!(auth.realm(), "WallyWorld");
    }

    #[test]
    fn empty_credentials_fail() {
        let mut auth = BasicAuth::default();
        auth.set_challenge("realm=\"x\"").unwrap();
        assert_eq!(
            auth.generate_response("", ""),
            Err(AuthError::MissingCredentials)
        );
    }
}
