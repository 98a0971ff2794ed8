/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use url::Url;

mod error;
pub use error::AuthError;

mod challenge;
pub use challenge::{best_offer, parse_params, scheme_token};

mod basic;
pub use basic::BasicAuth;

mod digest;
pub use digest::DigestAuth;

mod ntlm;
pub use ntlm::NtlmAuth;

/// One live credential/challenge conversation, site or proxy side. The
/// session replaces the whole object whenever the server switches schemes.
///
/// Negotiate is recognized by `best_offer` but building it fails with
/// `UnsupportedScheme` (no GSSAPI backend); the session then falls back to
/// the next best offered scheme.
pub enum AuthScheme {
    Basic(BasicAuth),
    Digest(DigestAuth),
    Ntlm(NtlmAuth),
}

impl AuthScheme {
    /// sniff the scheme tag at the start of a challenge string
    pub fn from_challenge(challenge: &str) -> Result<AuthScheme, AuthError> {
        let token = scheme_token(challenge);
        if token.eq_ignore_ascii_case("basic") {
            Ok(AuthScheme::Basic(BasicAuth::default()))
        } else if token.eq_ignore_ascii_case("digest") {
            Ok(AuthScheme::Digest(DigestAuth::default()))
        } else if token.eq_ignore_ascii_case("ntlm") {
            Ok(AuthScheme::Ntlm(NtlmAuth::default()))
        } else {
            Err(AuthError::UnsupportedScheme)
        }
    }

    pub fn scheme_name(&self) -> &'static str {
        match self {
            AuthScheme::Basic(_) => "Basic",
            AuthScheme::Digest(_) => "Digest",
            AuthScheme::Ntlm(_) => "NTLM",
        }
    }

    /// true when `challenge` carries the same scheme tag as this object
    pub fn matches_challenge(&self, challenge: &str) -> bool {
        scheme_token(challenge).eq_ignore_ascii_case(self.scheme_name())
    }

    pub fn set_challenge(
        &mut self,
        challenge: &str,
        url: &Url,
        method: &str,
    ) -> Result<(), AuthError> {
        let params_raw = challenge
            .trim_start()
            .strip_prefix(scheme_token(challenge))
            .unwrap_or("")
            .trim_start();
        match self {
            AuthScheme::Basic(a) => a.set_challenge(params_raw),
            AuthScheme::Digest(a) => a.set_challenge(params_raw, url, method),
            AuthScheme::Ntlm(a) => a.set_challenge(params_raw),
        }
    }

    pub fn generate_response(&mut self, username: &str, password: &str) -> Result<(), AuthError> {
        match self {
            AuthScheme::Basic(a) => a.generate_response(username, password),
            AuthScheme::Digest(a) => a.generate_response(username, password),
            AuthScheme::Ntlm(a) => a.generate_response(username, password),
        }
    }

    /// the ready-to-send header value, CRLF terminated; empty until a
    /// response has been generated
    pub fn header_fragment(&self) -> &str {
        match self {
            AuthScheme::Basic(a) => a.header_fragment(),
            AuthScheme::Digest(a) => a.header_fragment(),
            AuthScheme::Ntlm(a) => a.header_fragment(),
        }
    }

    pub fn realm(&self) -> &str {
        match self {
            AuthScheme::Basic(a) => a.realm(),
            AuthScheme::Digest(a) => a.realm(),
            AuthScheme::Ntlm(_) => "",
        }
    }

    /// multi-round-trip schemes ask the session to resend right away
    pub fn needs_another_round_trip(&self) -> bool {
        match self {
            AuthScheme::Ntlm(a) => a.needs_another_round_trip(),
            _ => false,
        }
    }

    pub fn force_keep_alive(&self) -> bool {
        match self {
            AuthScheme::Ntlm(a) => a.force_keep_alive(),
            _ => false,
        }
    }

    pub fn force_disconnect(&self) -> bool {
        match self {
            AuthScheme::Ntlm(a) => a.force_disconnect(),
            _ => false,
        }
    }

    /// a Digest `stale=true` challenge: retry with the same credentials
    pub fn retry_with_same_credentials(&self) -> bool {
        match self {
            AuthScheme::Digest(a) => a.stale(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniff_schemes() {
        assert!(matches!(
            AuthScheme::from_challenge("basic realm=\"x\""),
            Ok(AuthScheme::Basic(_))
        ));
        assert!(matches!(
            AuthScheme::from_challenge("Digest realm=\"x\", nonce=\"y\""),
            Ok(AuthScheme::Digest(_))
        ));
        assert!(matches!(
            AuthScheme::from_challenge("NTLM"),
            Ok(AuthScheme::Ntlm(_))
        ));
        assert_eq!(
            AuthScheme::from_challenge("Negotiate").err(),
            Some(AuthError::UnsupportedScheme)
        );
        assert_eq!(
            AuthScheme::from_challenge("Bearer abc").err(),
            Some(AuthError::UnsupportedScheme)
        );
    }

    #[test]
    fn full_basic_round() {
        let url = Url::parse("http://host/secret").unwrap();
        let mut auth = AuthScheme::from_challenge("Basic realm=\"lair\"").unwrap();
        auth.set_challenge("Basic realm=\"lair\"", &url, "GET").unwrap();
        auth.generate_response("Aladdin", "open sesame").unwrap();
        assert_eq!(
            auth.header_fragment(),
            "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==\r\n"
        );
        assert_eq!(auth.realm(), "lair");
        assert!(!auth.needs_another_round_trip());
    }
}
