//! SCRAM-SHA-256 client exchange (RFC 5802 / RFC 7677), without channel
//! binding.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::{Rng, distributions::Alphanumeric, thread_rng};
use sha2::{Digest, Sha256};

use super::DriverError;

pub const MECHANISM: &str = "SCRAM-SHA-256";

type HmacSha256 = Hmac<Sha256>;

/// State of one SCRAM exchange.
pub struct ScramClient {
    user: String,
    password: String,
    nonce: String,
    salted_password: Option<[u8; 32]>,
    auth_message: Option<String>,
}

impl ScramClient {
    pub fn new(user: &str, password: &str) -> Self {
        let nonce = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        Self::with_nonce(user, password, nonce)
    }

    fn with_nonce(user: &str, password: &str, nonce: String) -> Self {
        Self {
            user: user.to_owned(),
            password: password.to_owned(),
            nonce,
            salted_password: None,
            auth_message: None,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.user, self.nonce)
    }

    /// `client-first-message`, sent in SASLInitialResponse.
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Consumes `server-first-message` and returns `client-final-message`.
    pub fn client_final(&mut self, server_first: &[u8]) -> Result<Vec<u8>, DriverError> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|e| auth_error(format!("invalid UTF-8 in SASL continue: {e}")))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(value)
                        .map_err(|e| auth_error(format!("invalid salt: {e}")))?,
                );
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|e| auth_error(format!("invalid iteration count: {e}")))?,
                );
            }
        }

        let nonce = nonce.ok_or_else(|| auth_error("server nonce missing"))?;
        let salt = salt.ok_or_else(|| auth_error("salt missing"))?;
        let iterations = iterations.ok_or_else(|| auth_error("iteration count missing"))?;
        if !nonce.starts_with(&self.nonce) {
            return Err(auth_error("server nonce does not extend client nonce"));
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        )
        .map_err(|e| auth_error(format!("key derivation failed: {e}")))?;

        // "biws" is base64("n,,")
        let without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            without_proof
        );

        let client_key = hmac(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        self.salted_password = Some(salted_password);
        self.auth_message = Some(auth_message);

        Ok(format!("{without_proof},p={}", BASE64.encode(proof)).into_bytes())
    }

    /// Checks the server signature in `server-final-message`.
    pub fn verify(&self, server_final: &[u8]) -> Result<(), DriverError> {
        let server_final = std::str::from_utf8(server_final)
            .map_err(|e| auth_error(format!("invalid UTF-8 in SASL final: {e}")))?;
        if let Some(error) = server_final.strip_prefix("e=") {
            return Err(auth_error(format!("server rejected SCRAM exchange: {error}")));
        }
        let encoded = server_final
            .strip_prefix("v=")
            .ok_or_else(|| auth_error("malformed server-final message"))?;
        let received = BASE64
            .decode(encoded)
            .map_err(|e| auth_error(format!("invalid server signature: {e}")))?;

        let (Some(salted_password), Some(auth_message)) =
            (&self.salted_password, &self.auth_message)
        else {
            return Err(auth_error("server-final received before server-first"));
        };

        let server_key = hmac(salted_password, b"Server Key")?;
        let expected = hmac(&server_key, auth_message.as_bytes())?;
        if received.as_slice() != expected.as_slice() {
            return Err(auth_error("server signature mismatch"));
        }
        Ok(())
    }
}

fn auth_error(msg: impl Into<String>) -> DriverError {
    DriverError::Auth(msg.into())
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32], DriverError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| auth_error(format!("HMAC init failed: {e}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vector from RFC 7677 §3.
    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn client_first_format() {
        let client = ScramClient::with_nonce("user", "pencil", NONCE.to_owned());
        assert_eq!(client.client_first(), b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO");
    }

    #[test]
    fn rfc7677_exchange() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE.to_owned());
        let client_final = client.client_final(SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(client_final).unwrap(), CLIENT_FINAL);
        assert!(client.verify(SERVER_FINAL.as_bytes()).is_ok());
    }

    #[test]
    fn rejects_foreign_nonce() {
        let mut client = ScramClient::with_nonce("user", "pencil", "abc".to_owned());
        assert!(matches!(
            client.client_final(b"r=xyz,s=AAAA,i=1"),
            Err(DriverError::Auth(_))
        ));
    }

    #[test]
    fn rejects_bad_signature() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE.to_owned());
        client.client_final(SERVER_FIRST.as_bytes()).unwrap();
        assert!(client.verify(b"v=AAAA").is_err());
    }

    #[test]
    fn verify_before_first_fails() {
        let client = ScramClient::new("user", "pencil");
        assert!(client.verify(SERVER_FINAL.as_bytes()).is_err());
    }
}
