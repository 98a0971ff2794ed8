/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

/// scheme tag of a challenge string, i.e. everything before the first space
pub fn scheme_token(challenge: &str) -> &str {
    let s = challenge.trim_start();
    s.split_ascii_whitespace().next().unwrap_or("")
}

const SCHEME_PRIORITY: &[&str] = &["negotiate", "digest", "ntlm", "basic"];

/// Pick the strongest offered challenge: Negotiate > Digest > NTLM > Basic.
/// `None` when no offer carries a scheme we can do anything with.
pub fn best_offer(offers: &[&str]) -> Option<usize> {
    for want in SCHEME_PRIORITY {
        if let Some(idx) = offers
            .iter()
            .position(|o| scheme_token(o).eq_ignore_ascii_case(want))
        {
            return Some(idx);
        }
    }
    None
}

/// Parse the `k=v, k="quoted \" value", token` parameter list that follows
/// the scheme tag. Keys come back lowercased; a bare token becomes a key
/// with an empty value. Sloppy input never fails, it just yields fewer
/// pairs — challenge validation happens scheme by scheme.
pub fn parse_params(input: &str) -> Vec<(String, String)> {
    let b = input.as_bytes();
    let mut out = Vec::new();
    let mut pos = 0;

    loop {
        while pos < b.len() && matches!(b[pos], b' ' | b'\t' | b',') {
            pos += 1;
        }
        if pos >= b.len() {
            return out;
        }

        let key_start = pos;
        while pos < b.len() && !matches!(b[pos], b'=' | b',' | b' ' | b'\t') {
            pos += 1;
        }
        let key = input[key_start..pos].to_lowercase();

        while pos < b.len() && matches!(b[pos], b' ' | b'\t') {
            pos += 1;
        }
        if pos >= b.len() || b[pos] != b'=' {
            out.push((key, String::new()));
            continue;
        }
        pos += 1;
        while pos < b.len() && matches!(b[pos], b' ' | b'\t') {
            pos += 1;
        }

        let mut value = String::new();
        if pos < b.len() && b[pos] == b'"' {
            pos += 1;
            while pos < b.len() {
                match b[pos] {
                    b'\\' if pos + 1 < b.len() => {
                        value.push(b[pos + 1] as char);
                        pos += 2;
                    }
                    b'"' => {
                        pos += 1;
                        break;
                    }
                    c => {
                        value.push(c as char);
                        pos += 1;
                    }
                }
            }
        } else {
            let val_start = pos;
            while pos < b.len() && !matches!(b[pos], b',' | b' ' | b'\t') {
                pos += 1;
            }
            value.push_str(&input[val_start..pos]);
        }
        out.push((key, value));
    }
}

pub(crate) fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order() {
        let mut offers = vec![
            "NTLM",
            "Basic realm=\"a\"",
            "Negotiate",
            "Digest realm=\"a\", nonce=\"b\"",
            "MagicScheme foo",
        ];
        assert_eq!(best_offer(&offers), Some(2));
        offers.remove(2);
        assert_eq!(best_offer(&offers), Some(2)); // digest moved up
        offers.remove(2);
        assert_eq!(best_offer(&offers), Some(0)); // ntlm
        offers.remove(0);
        assert_eq!(best_offer(&offers), Some(0)); // basic
        offers.remove(0);
        assert_eq!(best_offer(&offers), None); // only MagicScheme left
    }

    #[test]
    fn params_mixed() {
        let p = parse_params("realm=\"test@host\", qop=\"auth,auth-int\", stale=true, Algorithm=MD5");
        assert_eq!(param(&p, "realm"), Some("test@host"));
        assert_eq!(param(&p, "qop"), Some("auth,auth-int"));
        assert_eq!(param(&p, "stale"), Some("true"));
        assert_eq!(param(&p, "algorithm"), Some("MD5"));
    }

    #[test]
    fn quoted_escapes() {
        let p = parse_params(r#"opaque="a \"quoted\" thing""#);
        assert_eq!(param(&p, "opaque"), Some(r#"a "quoted" thing"#));
    }

    #[test]
    fn bare_token() {
        let p = parse_params("stale");
        assert_eq!(param(&p, "stale"), Some(""));
    }
}
