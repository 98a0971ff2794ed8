/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use url::Url;

/// The external credential store the session consults before prompting-class
/// failures and writes back to after the first successful round. Keyed by
/// (url, realm); the store itself is somebody else's problem.
pub trait CredentialProvider: Send + Sync {
    fn lookup(&self, url: &Url, realm: &str) -> Option<(String, String)>;

    fn store(&self, url: &Url, realm: &str, username: &str, password: &str);
}

/// Fixed username/password for every realm. Enough for scripted use and for
/// servers with a single account.
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        StaticCredentials {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn lookup(&self, _url: &Url, _realm: &str) -> Option<(String, String)> {
        Some((self.username.clone(), self.password.clone()))
    }

    fn store(&self, _url: &Url, _realm: &str, _username: &str, _password: &str) {}
}
