use ring::digest;
use ring::hmac;
use rustls::{ClientConfig, RootCertStore};

use crate::config::AuthConfig;
use crate::error::{ChannelError, ChannelResult};
use crate::types::PublicKey;

/// The four headers sent on the WebSocket upgrade request when using
/// shared-secret authentication, per spec 4.1 / 6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedSecretHeaders {
    pub alg: String,
    pub key: String,
    pub time: String,
    pub signature: String,
}

/// Builds the `NH1-HMAC-<digest>-<iterations>-<key-length>` signed headers
/// for shared-secret authentication. `now_unix_secs` is passed in rather
/// than read from the clock so the salt string is reproducible in tests;
/// callers regenerate these on every (re)connect attempt since stale
/// timestamps may be rejected by the server.
pub fn build_shared_secret_headers(
    key_id: &str,
    secret: &str,
    digest_name: &str,
    iterations: u32,
    key_length: u32,
    device_identifier: &str,
    now_unix_secs: u64,
) -> ChannelResult<SharedSecretHeaders> {
    if iterations == 0 {
        return Err(ChannelError::Authentication(
            "iterations must be greater than zero".into(),
        ));
    }

    let alg = format!("NH1-HMAC-{digest_name}-{iterations}-{key_length}");
    let time = now_unix_secs.to_string();
    let salt = shared_secret_salt(&alg, key_id, &time, device_identifier);
    let signature = hex::encode(iterated_hmac(secret.as_bytes(), salt.as_bytes(), iterations));

    Ok(SharedSecretHeaders {
        alg,
        key: key_id.to_string(),
        time,
        signature,
    })
}

/// Fixed multi-line salt template so the server can reconstruct the exact
/// bytes that were signed, per spec 4.1.
fn shared_secret_salt(alg: &str, key_id: &str, time: &str, device_identifier: &str) -> String {
    format!("NH1\nalg={alg}\nkey={key_id}\ntime={time}\nid={device_identifier}\n")
}

/// Applies HMAC-SHA256 to `message` under `key`, repeating `iterations`
/// times by feeding each tag back in as the next round's message. One
/// iteration is a plain HMAC.
fn iterated_hmac(key: &[u8], message: &[u8], iterations: u32) -> Vec<u8> {
    let hmac_key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let mut tag = hmac::sign(&hmac_key, message).as_ref().to_vec();
    for _ in 1..iterations {
        tag = hmac::sign(&hmac_key, &tag).as_ref().to_vec();
    }
    tag
}

/// Builds a rustls `ClientConfig` for mutual-TLS connections from PEM-encoded
/// client certificate, private key, and CA bundle.
pub fn mutual_tls_config(
    client_cert_pem: &str,
    client_key_pem: &str,
    ca_cert_pem: &str,
) -> ChannelResult<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_cert_pem.as_bytes()) {
        let cert = cert.map_err(|e| ChannelError::Authentication(format!("invalid ca cert: {e}")))?;
        root_store
            .add(cert)
            .map_err(|e| ChannelError::Authentication(format!("failed to add ca cert: {e}")))?;
    }

    let cert_chain: Vec<_> = rustls_pemfile::certs(&mut client_cert_pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| ChannelError::Authentication(format!("invalid client cert: {e}")))?;

    let key = rustls_pemfile::private_key(&mut client_key_pem.as_bytes())
        .map_err(|e| ChannelError::Authentication(format!("invalid client key: {e}")))?
        .ok_or_else(|| ChannelError::Authentication("no private key found in PEM".into()))?;

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(cert_chain, key)
        .map_err(|e| ChannelError::Authentication(format!("invalid client identity: {e}")))?;

    Ok(config)
}

/// Builds a plain (no client auth) `ClientConfig` trusting the system's
/// native root store, used for plain `wss` connections and for verifying
/// the TLS transport when shared-secret auth supplies the identity instead.
pub fn system_tls_config() -> ChannelResult<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs()
        .map_err(|e| ChannelError::Authentication(format!("failed to load native certs: {e}")))?
    {
        root_store
            .add(cert)
            .map_err(|e| ChannelError::Authentication(format!("failed to add cert: {e}")))?;
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// Verifies a firmware/archive signature by invoking the configured
/// external flasher with `--verify`; this module only decides which public
/// keys to try and in what order. The actual process invocation lives in
/// the platform crate's `Flasher` adapter.
pub fn sha256(data: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA256, data).as_ref().to_vec()
}

/// An ordered attempt list: any public key accepting the signature is
/// sufficient, per spec 4.4 ("any success accepts").
pub fn candidate_keys(keys: &[PublicKey]) -> impl Iterator<Item = &PublicKey> {
    keys.iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_headers_are_deterministic() {
        let a = build_shared_secret_headers("k1", "s3cr3t", "sha256", 10, 16, "device-1", 1_700_000_000)
            .unwrap();
        let b = build_shared_secret_headers("k1", "s3cr3t", "sha256", 10, 16, "device-1", 1_700_000_000)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.alg, "NH1-HMAC-sha256-10-16");
    }

    #[test]
    fn shared_secret_headers_change_with_time() {
        let a = build_shared_secret_headers("k1", "s3cr3t", "sha256", 10, 16, "device-1", 1_700_000_000)
            .unwrap();
        let b = build_shared_secret_headers("k1", "s3cr3t", "sha256", 10, 16, "device-1", 1_700_000_001)
            .unwrap();
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn zero_iterations_is_rejected() {
        assert!(build_shared_secret_headers("k1", "s", "sha256", 0, 16, "d", 0).is_err());
    }

    #[test]
    fn sha256_is_32_bytes() {
        assert_eq!(sha256(b"hello").len(), 32);
    }
}
