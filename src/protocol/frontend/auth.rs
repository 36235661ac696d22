//! Authentication messages and the client side of SCRAM-SHA-256.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::protocol::codec::MessageBuilder;

/// Write a PasswordMessage (cleartext or MD5 hashed password).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(password);
    msg.finish();
}

/// Compute MD5 password hash.
///
/// PostgreSQL MD5 password format: "md5" + md5(md5(password + username) + salt)
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::Md5;

    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let first_hash_hex = format!("{:x}", hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(first_hash_hex.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}

/// Write a SASLInitialResponse message.
pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, initial_response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_cstr(mechanism);
    msg.write_i32(initial_response.len() as i32);
    msg.write_bytes(initial_response);
    msg.finish();
}

/// Write a SASLResponse message.
pub fn write_sasl_response(buf: &mut Vec<u8>, response: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.write_bytes(response);
    msg.finish();
}

/// SCRAM mechanism names.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
pub const SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";

/// How the SCRAM exchange relates to the TLS channel (RFC 5802 gs2 header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScramBinding {
    /// `n,,` - client does not support channel binding.
    None,
    /// `y,,` - client supports binding but the server did not offer it.
    NotOffered,
    /// `p=tls-server-end-point,,` with the server certificate hash.
    TlsServerEndPoint(Vec<u8>),
}

impl ScramBinding {
    fn gs2_header(&self) -> &'static str {
        match self {
            ScramBinding::None => "n,,",
            ScramBinding::NotOffered => "y,,",
            ScramBinding::TlsServerEndPoint(_) => "p=tls-server-end-point,,",
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            ScramBinding::TlsServerEndPoint(data) => data,
            _ => &[],
        }
    }
}

/// SCRAM-SHA-256 client.
pub struct ScramClient {
    user: String,
    nonce: String,
    binding: ScramBinding,
    password: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    /// Create a new SCRAM client with a random nonce.
    pub fn new(password: &str, binding: ScramBinding) -> Self {
        use rand::Rng;

        let mut nonce_bytes = [0u8; 24];
        rand::rng().fill(&mut nonce_bytes);
        Self::with_nonce(password, binding, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(password: &str, binding: ScramBinding, nonce: String) -> Self {
        Self {
            // PostgreSQL takes the user from the startup message
            user: String::new(),
            nonce,
            binding,
            password: password.to_string(),
            auth_message: None,
            salted_password: None,
        }
    }

    /// Mechanism name to announce in SASLInitialResponse.
    pub fn mechanism(&self) -> &'static str {
        match self.binding {
            ScramBinding::TlsServerEndPoint(_) => SCRAM_SHA_256_PLUS,
            _ => SCRAM_SHA_256,
        }
    }

    fn client_first_message_bare(&self) -> String {
        format!("n={},r={}", self.user, self.nonce)
    }

    /// Generate the client-first-message.
    pub fn client_first_message(&self) -> String {
        format!(
            "{}{}",
            self.binding.gs2_header(),
            self.client_first_message_bare()
        )
    }

    /// Process server-first-message and generate client-final-message.
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String, String> {
        let mut combined_nonce = None;
        let mut salt_b64 = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt_b64 = Some(value);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = value.parse::<u32>().ok();
            }
        }

        let combined_nonce = combined_nonce.ok_or("Missing nonce in server-first-message")?;
        let salt_b64 = salt_b64.ok_or("Missing salt in server-first-message")?;
        let iterations = iterations.ok_or("Missing iterations in server-first-message")?;

        if !combined_nonce.starts_with(&self.nonce) {
            return Err("Server nonce doesn't start with client nonce".to_string());
        }

        let salt = BASE64
            .decode(salt_b64)
            .map_err(|e| format!("Invalid salt: {}", e))?;

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );
        self.salted_password = Some(salted_password);

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);

        // c= carries the gs2 header followed by the binding data
        let mut cbind_input = self.binding.gs2_header().as_bytes().to_vec();
        cbind_input.extend_from_slice(self.binding.data());
        let client_final_without_proof =
            format!("c={},r={}", BASE64.encode(&cbind_input), combined_nonce);

        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare(),
            server_first,
            client_final_without_proof
        );
        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        self.auth_message = Some(auth_message);

        let mut client_proof = [0u8; 32];
        for (i, byte) in client_proof.iter_mut().enumerate() {
            *byte = client_key[i] ^ client_signature[i];
        }

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        ))
    }

    /// Verify server-final-message.
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), String> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(format!("Server rejected SCRAM exchange: {}", err));
        }
        let server_signature_b64 = server_final
            .strip_prefix("v=")
            .ok_or("Invalid server-final-message format")?;
        let server_signature = BASE64
            .decode(server_signature_b64.trim_end())
            .map_err(|e| format!("Invalid server signature: {}", e))?;

        let salted_password = self
            .salted_password
            .as_ref()
            .ok_or("Missing salted password")?;
        let auth_message = self.auth_message.as_ref().ok_or("Missing auth message")?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if server_signature.as_slice() != expected.as_slice() {
            return Err("Server signature verification failed".to_string());
        }
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], String> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| format!("HMAC error: {}", e))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
