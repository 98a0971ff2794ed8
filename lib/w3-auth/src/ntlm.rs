/*
 * SPDX-License-Identifier: Apache-2.0
 * Copyright 2025 ByteDance and/or its affiliates.
 */

use base64::prelude::*;
use des::Des;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use digest::Digest;
use md4::Md4;

use super::AuthError;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const NEGOTIATE_OEM: u32 = 0x0000_0002;
const REQUEST_TARGET: u32 = 0x0000_0004;
const NEGOTIATE_NTLM: u32 = 0x0000_0200;

enum NtlmState {
    /// nothing from the server yet, a Type 1 negotiate goes out next
    Negotiate,
    /// Type 2 received, a Type 3 authenticate goes out next
    Challenged { flags: u32, challenge: [u8; 8] },
    /// Type 3 sent; the challenge is gone so it can never be replayed
    Done,
}

pub struct NtlmAuth {
    state: NtlmState,
    header: String,
    needs_round_trip: bool,
    force_keep_alive: bool,
    force_disconnect: bool,
}

impl Default for NtlmAuth {
    fn default() -> Self {
        NtlmAuth {
            state: NtlmState::Negotiate,
            header: String::new(),
            needs_round_trip: false,
            force_keep_alive: false,
            force_disconnect: false,
        }
    }
}

impl NtlmAuth {
    pub fn set_challenge(&mut self, params_raw: &str) -> Result<(), AuthError> {
        let raw = params_raw.trim();
        self.header.clear();
        self.needs_round_trip = false;
        self.force_keep_alive = false;
        self.force_disconnect = false;

        if raw.is_empty() {
            // a bare challenge while mid-conversation means the server gave
            // up on it, start over on a fresh connection
            if !matches!(self.state, NtlmState::Negotiate) {
                self.force_disconnect = true;
            }
            self.state = NtlmState::Negotiate;
            return Ok(());
        }

        let data = BASE64_STANDARD
            .decode(raw)
            .map_err(|_| AuthError::MalformedChallenge("bad base64 in NTLM challenge"))?;
        let (flags, challenge) = parse_type2(&data)?;
        self.state = NtlmState::Challenged { flags, challenge };
        Ok(())
    }

    pub fn generate_response(&mut self, username: &str, password: &str) -> Result<(), AuthError> {
        if username.is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        match self.state {
            NtlmState::Negotiate => {
                self.header = format!("NTLM {}\r\n", BASE64_STANDARD.encode(type1_message()));
                // the Type 2 reply only makes sense on this same connection
                self.needs_round_trip = true;
                self.force_keep_alive = true;
            }
            NtlmState::Challenged { flags, challenge } => {
                let (domain, user) = match username.split_once('\\') {
                    Some((d, u)) => (d, u),
                    None => ("", username),
                };
                let workstation = std::env::var("HOSTNAME").unwrap_or_default();
                let msg = type3_message(user, password, domain, &workstation, flags, &challenge);
                self.header = format!("NTLM {}\r\n", BASE64_STANDARD.encode(msg));
                self.needs_round_trip = false;
                self.force_keep_alive = false;
                self.state = NtlmState::Done;
            }
            NtlmState::Done => {
                return Err(AuthError::MalformedChallenge("NTLM challenge already used"));
            }
        }
        Ok(())
    }

    pub fn header_fragment(&self) -> &str {
        &self.header
    }

    pub fn realm(&self) -> &str {
        // NTLM authenticates against the account domain, there is no realm
        ""
    }

    pub fn needs_another_round_trip(&self) -> bool {
        self.needs_round_trip
    }

    pub fn force_keep_alive(&self) -> bool {
        self.force_keep_alive
    }

    pub fn force_disconnect(&self) -> bool {
        self.force_disconnect
    }
}

fn put_security_buffer(buf: &mut Vec<u8>, len: usize, offset: usize) {
    let len = len as u16;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&(offset as u32).to_le_bytes());
}

fn type1_message() -> Vec<u8> {
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    let flags = NEGOTIATE_UNICODE | NEGOTIATE_OEM | REQUEST_TARGET | NEGOTIATE_NTLM;
    msg.extend_from_slice(&flags.to_le_bytes());
    // empty domain and workstation buffers
    put_security_buffer(&mut msg, 0, 32);
    put_security_buffer(&mut msg, 0, 32);
    msg
}

fn parse_type2(data: &[u8]) -> Result<(u32, [u8; 8]), AuthError> {
    if data.len() < 32 {
        return Err(AuthError::MalformedChallenge("short NTLM type 2 message"));
    }
    if &data[0..8] != SIGNATURE {
        return Err(AuthError::MalformedChallenge("bad NTLM signature"));
    }
    let msg_type = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if msg_type != 2 {
        return Err(AuthError::MalformedChallenge("not an NTLM type 2 message"));
    }
    let flags = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);
    let mut challenge = [0u8; 8];
    challenge.copy_from_slice(&data[24..32]);
    Ok((flags, challenge))
}

fn encode_string(s: &str, unicode: bool) -> Vec<u8> {
    if unicode {
        s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
    } else {
        s.as_bytes().to_vec()
    }
}

fn type3_message(
    user: &str,
    password: &str,
    domain: &str,
    workstation: &str,
    flags: u32,
    challenge: &[u8; 8],
) -> Vec<u8> {
    let unicode = flags & NEGOTIATE_UNICODE != 0;
    let domain_bytes = encode_string(domain, unicode);
    let user_bytes = encode_string(user, unicode);
    let ws_bytes = encode_string(workstation, unicode);

    let lm = challenge_response(&lm_hash(password), challenge);
    let nt = challenge_response(&nt_hash(password), challenge);

    const HEADER_LEN: usize = 64;
    let domain_off = HEADER_LEN;
    let user_off = domain_off + domain_bytes.len();
    let ws_off = user_off + user_bytes.len();
    let lm_off = ws_off + ws_bytes.len();
    let nt_off = lm_off + lm.len();
    let session_off = nt_off + nt.len();

    let mut msg = Vec::with_capacity(session_off);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes());
    put_security_buffer(&mut msg, lm.len(), lm_off);
    put_security_buffer(&mut msg, nt.len(), nt_off);
    put_security_buffer(&mut msg, domain_bytes.len(), domain_off);
    put_security_buffer(&mut msg, user_bytes.len(), user_off);
    put_security_buffer(&mut msg, ws_bytes.len(), ws_off);
    put_security_buffer(&mut msg, 0, session_off);
    let rsp_flags = if unicode {
        NEGOTIATE_UNICODE | NEGOTIATE_NTLM
    } else {
        NEGOTIATE_OEM | NEGOTIATE_NTLM
    };
    msg.extend_from_slice(&rsp_flags.to_le_bytes());
    msg.extend_from_slice(&domain_bytes);
    msg.extend_from_slice(&user_bytes);
    msg.extend_from_slice(&ws_bytes);
    msg.extend_from_slice(&lm);
    msg.extend_from_slice(&nt);
    msg
}

/// spread 56 key bits over 8 bytes, parity bits left clear
fn make_des_key(k: &[u8]) -> [u8; 8] {
    [
        k[0],
        (k[0] << 7) | (k[1] >> 1),
        (k[1] << 6) | (k[2] >> 2),
        (k[2] << 5) | (k[3] >> 3),
        (k[3] << 4) | (k[4] >> 4),
        (k[4] << 3) | (k[5] >> 5),
        (k[5] << 2) | (k[6] >> 6),
        k[6] << 1,
    ]
}

fn des_encrypt(key7: &[u8], block: &[u8; 8]) -> [u8; 8] {
    let key = make_des_key(key7);
    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

fn lm_hash(password: &str) -> [u8; 16] {
    const MAGIC: &[u8; 8] = b"KGS!@#$%";
    let mut padded = [0u8; 14];
    for (i, b) in password.bytes().take(14).enumerate() {
        padded[i] = b.to_ascii_uppercase();
    }
    let mut hash = [0u8; 16];
    hash[0..8].copy_from_slice(&des_encrypt(&padded[0..7], MAGIC));
    hash[8..16].copy_from_slice(&des_encrypt(&padded[7..14], MAGIC));
    hash
}

fn nt_hash(password: &str) -> [u8; 16] {
    let utf16: Vec<u8> = password
        .encode_utf16()
        .flat_map(|c| c.to_le_bytes())
        .collect();
    Md4::digest(&utf16).into()
}

/// the NTLMv1 response: hash padded to 21 bytes, split into three DES keys,
/// each encrypting the server challenge
fn challenge_response(hash: &[u8; 16], challenge: &[u8; 8]) -> [u8; 24] {
    let mut padded = [0u8; 21];
    padded[0..16].copy_from_slice(hash);
    let mut out = [0u8; 24];
    out[0..8].copy_from_slice(&des_encrypt(&padded[0..7], challenge));
    out[8..16].copy_from_slice(&des_encrypt(&padded[7..14], challenge));
    out[16..24].copy_from_slice(&des_encrypt(&padded[14..21], challenge));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // worked example from the "NTLM Authentication Protocol" description:
    // password SecREt01, server challenge 0x0123456789abcdef
    const CHALLENGE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];

    #[test]
    fn lm_response_vector() {
        let lm = challenge_response(&lm_hash("SecREt01"), &CHALLENGE);
        assert_eq!(
            hex::encode(lm),
            "c337cd5cbd44fc9782a667af6d427c6de67c20c2d3e77c56"
        );
    }

    #[test]
    fn nt_response_vector() {
        let nt = challenge_response(&nt_hash("SecREt01"), &CHALLENGE);
        assert_eq!(
            hex::encode(nt),
            "25a98c1c31e81847466b29b2df4680f39958fb8c213a9cc6"
        );
    }

    #[test]
    fn negotiate_then_authenticate() {
        let mut auth = NtlmAuth::default();
        auth.set_challenge("").unwrap();
        auth.generate_response("DOMAIN\\user", "SecREt01").unwrap();
        assert!(auth.needs_another_round_trip());
        assert!(auth.force_keep_alive());
        // canonical base64 prefix of "NTLMSSP\0" + type 1
        assert!(auth.header_fragment().starts_with("NTLM TlRMTVNTUAAB"));

        // hand the negotiate flags + challenge back as a type 2 message
        let mut type2 = Vec::new();
        type2.extend_from_slice(SIGNATURE);
        type2.extend_from_slice(&2u32.to_le_bytes());
        put_security_buffer(&mut type2, 0, 48);
        type2.extend_from_slice(&NEGOTIATE_UNICODE.to_le_bytes());
        type2.extend_from_slice(&CHALLENGE);
        type2.extend_from_slice(&[0u8; 16]);

        auth.set_challenge(&BASE64_STANDARD.encode(&type2)).unwrap();
        auth.generate_response("DOMAIN\\user", "SecREt01").unwrap();
        assert!(!auth.needs_another_round_trip());
        assert!(auth.header_fragment().starts_with("NTLM TlRMTVNTUAAD"));

        let b64 = auth
            .header_fragment()
            .trim_end()
            .strip_prefix("NTLM ")
            .unwrap();
        let msg = BASE64_STANDARD.decode(b64).unwrap();
        let nt_len = u16::from_le_bytes([msg[20], msg[21]]) as usize;
        let nt_off = u32::from_le_bytes([msg[24], msg[25], msg[26], msg[27]]) as usize;
        let expected = challenge_response(&nt_hash("SecREt01"), &CHALLENGE);
        assert_eq!(&msg[nt_off..nt_off + nt_len], expected.as_slice());
    }

    #[test]
    fn bad_type2_rejected() {
        let mut auth = NtlmAuth::default();
        let garbage = BASE64_STANDARD.encode(b"not an ntlm message at all");
        assert!(auth.set_challenge(&garbage).is_err());
    }
}
