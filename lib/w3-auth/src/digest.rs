/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use digest::Digest;
use md5::Md5;
use url::Url;

use super::AuthError;
use super::challenge::{param, parse_params};

#[derive(Clone, Copy, PartialEq, Eq)]
enum DigestAlgorithm {
    Md5,
    Md5Sess,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DigestQop {
    None,
    Auth,
    /// server insists on auth-int; we have no entity digest to offer
    AuthIntOnly,
}

pub struct DigestAuth {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: DigestAlgorithm,
    qop: DigestQop,
    domain: Vec<Url>,
    stale: bool,
    url: Option<Url>,
    method: String,
    cnonce: String,
    header: String,
}

impl Default for DigestAuth {
    fn default() -> Self {
        DigestAuth {
            realm: String::new(),
            nonce: String::new(),
            opaque: None,
            algorithm: DigestAlgorithm::Md5,
            qop: DigestQop::None,
            domain: Vec::new(),
            stale: false,
            url: None,
            method: String::new(),
            cnonce: String::new(),
            header: String::new(),
        }
    }
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn random_cnonce() -> String {
    std::iter::repeat_with(fastrand::alphanumeric).take(16).collect()
}

impl DigestAuth {
    pub fn set_challenge(
        &mut self,
        params_raw: &str,
        url: &Url,
        method: &str,
    ) -> Result<(), AuthError> {
        let params = parse_params(params_raw);

        self.realm = param(&params, "realm").unwrap_or("").to_string();
        self.nonce = param(&params, "nonce").unwrap_or("").to_string();
        if self.realm.is_empty() || self.nonce.is_empty() {
            return Err(AuthError::MalformedChallenge("realm or nonce missing"));
        }
        self.opaque = param(&params, "opaque").map(|s| s.to_string());

        // some servers misspell the key as "algorith"
        let algorithm = param(&params, "algorithm")
            .or_else(|| param(&params, "algorith"))
            .unwrap_or("MD5");
        self.algorithm = if algorithm.eq_ignore_ascii_case("md5") {
            DigestAlgorithm::Md5
        } else if algorithm.eq_ignore_ascii_case("md5-sess") {
            DigestAlgorithm::Md5Sess
        } else {
            return Err(AuthError::MalformedChallenge("unsupported algorithm"));
        };

        self.qop = match param(&params, "qop") {
            None => DigestQop::None,
            Some(list) => {
                let mut qop = DigestQop::AuthIntOnly;
                for q in list.split(',') {
                    if q.trim().eq_ignore_ascii_case("auth") {
                        qop = DigestQop::Auth;
                    }
                }
                qop
            }
        };

        self.domain.clear();
        if let Some(domain) = param(&params, "domain") {
            for part in domain.split_ascii_whitespace() {
                if let Ok(u) = url.join(part) {
                    self.domain.push(u);
                }
            }
        }

        self.stale = param(&params, "stale")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        self.url = Some(url.clone());
        self.method = method.to_string();
        self.cnonce = random_cnonce();
        self.header.clear();
        Ok(())
    }

    /// `stale=true` means the nonce expired: retry with the same credentials
    /// instead of asking the user again
    pub fn stale(&self) -> bool {
        self.stale
    }

    fn in_protection_domain(&self, url: &Url) -> bool {
        if self.domain.is_empty() {
            return true;
        }
        let request_path = if url.path().is_empty() { "/" } else { url.path() };
        self.domain.iter().any(|u| {
            u.scheme().eq_ignore_ascii_case(url.scheme())
                && u.host_str().unwrap_or("").eq_ignore_ascii_case(url.host_str().unwrap_or(""))
                && u.port_or_known_default() == url.port_or_known_default()
                && request_path.starts_with(u.path())
        })
    }

    pub fn generate_response(&mut self, username: &str, password: &str) -> Result<(), AuthError> {
        if username.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        if self.qop == DigestQop::AuthIntOnly {
            return Err(AuthError::EntityDigestUnavailable);
        }
        let Some(url) = self.url.clone() else {
            return Err(AuthError::MalformedChallenge("no challenge seen yet"));
        };
        if !self.in_protection_domain(&url) {
            // never replay credentials against a url the server did not vouch for
            return Err(AuthError::OutOfProtectionDomain);
        }

        let mut digest_uri = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };
        if let Some(q) = url.query() {
            digest_uri.push('?');
            digest_uri.push_str(q);
        }

        let mut ha1 = md5_hex(&format!("{username}:{}:{password}", self.realm));
        if self.algorithm == DigestAlgorithm::Md5Sess {
            ha1 = md5_hex(&format!("{ha1}:{}:{}", self.nonce, self.cnonce));
        }

        let ha2 = md5_hex(&format!("{}:{digest_uri}", self.method));

        const NC: &str = "00000001";
        let response = match self.qop {
            DigestQop::Auth => md5_hex(&format!(
                "{ha1}:{}:{NC}:{}:auth:{ha2}",
                self.nonce, self.cnonce
            )),
            _ => md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce)),
        };

        let algorithm = match self.algorithm {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
        };
        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{digest_uri}\"",
            self.realm, self.nonce
        );
        if self.qop == DigestQop::Auth {
            header.push_str(&format!(", qop=auth, nc={NC}, cnonce=\"{}\"", self.cnonce));
        }
        header.push_str(&format!(", response=\"{response}\", algorithm={algorithm}"));
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header.push_str("\r\n");
        self.header = header;
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
    fn rfc2617_worked_example() {
        let url = Url::parse("http://host/dir/index.html").unwrap();
        let mut auth = DigestAuth::default();
        auth.set_challenge(
            "realm=\"testrealm@host.com\", qop=\"auth,auth-int\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", \
             opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
            &url,
            "GET",
        )
        .unwrap();
        auth.cnonce = "0a4f113b".to_string();
        auth.generate_response("Mufasa", "Circle Of Life").unwrap();

        let header = auth.header_fragment();
        assert!(header.starts_with("Digest username=\"Mufasa\""));
        assert!(header.contains("response=\"6629fae49393a05397450978507c4ef1\""));
        assert!(header.contains("uri=\"/dir/index.html\""));
        assert!(header.contains("nc=00000001"));
        assert!(header.contains("opaque=\"5ccc069c403ebaf9f0171e9517f40e41\""));
        assert!(header.ends_with("\r\n"));
    }

    #[test]
    fn no_qop_uses_short_response() {
        let url = Url::parse("http://host/x").unwrap();
        let mut auth = DigestAuth::default();
        auth.set_challenge("realm=\"r\", nonce=\"n\"", &url, "GET").unwrap();
        auth.generate_response("u", "p").unwrap();
        let header = auth.header_fragment();
        assert!(!header.contains("qop="));
        assert!(!header.contains("cnonce="));
    }

    #[test]
    fn domain_scope_enforced() {
        let url = Url::parse("http://host/private/data").unwrap();
        let mut auth = DigestAuth::default();
        auth.set_challenge(
            "realm=\"r\", nonce=\"n\", domain=\"/private/\"",
            &url,
            "GET",
        )
        .unwrap();
        assert!(auth.generate_response("u", "p").is_ok());

        let outside = Url::parse("http://host/other/data").unwrap();
        let mut auth = DigestAuth::default();
        auth.set_challenge(
            "realm=\"r\", nonce=\"n\", domain=\"/private/\"",
            &outside,
            "GET",
        )
        .unwrap();
        assert_eq!(
            auth.generate_response("u", "p"),
            Err(AuthError::OutOfProtectionDomain)
        );
    }

    #[test]
    fn stale_challenge_flagged() {
        let url = Url::parse("http://host/").unwrap();
        let mut auth = DigestAuth::default();
        auth.set_challenge("realm=\"r\", nonce=\"n2\", stale=true", &url, "GET")
            .unwrap();
        assert!(auth.stale());
    }

    #[test]
    fn auth_int_only_refused() {
        let url = Url::parse("http://host/").unwrap();
        let mut auth = DigestAuth::default();
        auth.set_challenge("realm=\"r\", nonce=\"n\", qop=\"auth-int\"", &url, "GET")
            .unwrap();
        assert_eq!(
            auth.generate_response("u", "p"),
            Err(AuthError::EntityDigestUnavailable)
        );
    }
}
