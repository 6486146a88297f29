use tungstenite::handshake::client::generate_key;
use tungstenite::http::{Request, Uri};

use crate::config::AuthConfig;
use crate::error::{ChannelError, ChannelResult};
use crate::security::{build_shared_secret_headers, mutual_tls_config, system_tls_config};

/// Either a plain TLS connector (mutual TLS identity baked into the client
/// config) or a set of request headers to attach for shared-secret auth.
pub enum ConnectAuth {
    MutualTls(rustls::ClientConfig),
    SharedSecret(rustls::ClientConfig, Vec<(String, String)>),
}

/// Resolves the configured auth variant into what `connect()` needs: a TLS
/// config, and, for shared-secret auth, the `x-nh-*` headers from spec 6.
pub fn resolve(
    auth: &AuthConfig,
    device_identifier: &str,
    now_unix_secs: u64,
) -> ChannelResult<ConnectAuth> {
    match auth {
        AuthConfig::MutualTls {
            client_cert_pem,
            client_key_pem,
            ca_cert_pem,
        } => {
            let tls = mutual_tls_config(client_cert_pem, client_key_pem, ca_cert_pem)?;
            Ok(ConnectAuth::MutualTls(tls))
        }
        AuthConfig::SharedSecret {
            key_id,
            secret,
            digest,
            iterations,
            key_length,
        } => {
            let headers = build_shared_secret_headers(
                key_id,
                secret,
                digest,
                *iterations,
                *key_length,
                device_identifier,
                now_unix_secs,
            )?;
            let tls = system_tls_config()?;
            Ok(ConnectAuth::SharedSecret(
                tls,
                vec![
                    ("x-nh-alg".to_string(), headers.alg),
                    ("x-nh-key".to_string(), headers.key),
                    ("x-nh-time".to_string(), headers.time),
                    ("x-nh-signature".to_string(), headers.signature),
                ],
            ))
        }
    }
}

/// Builds the HTTP upgrade request for the WebSocket handshake, attaching
/// shared-secret headers when present. Mutual TLS carries its identity in
/// the TLS layer, not the headers.
pub fn build_request(url: &str, host: &str, auth: &ConnectAuth) -> ChannelResult<Request<()>> {
    let uri: Uri = url
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| ChannelError::Connection(e.to_string()))?;

    let mut builder = Request::builder()
        .uri(uri)
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key());

    if let ConnectAuth::SharedSecret(_, headers) = auth {
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
    }

    builder
        .body(())
        .map_err(|e| ChannelError::Connection(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_resolves_to_headers() {
        let auth = AuthConfig::SharedSecret {
            key_id: "k1".into(),
            secret: "s3cr3t".into(),
            digest: "sha256".into(),
            iterations: 4,
            key_length: 16,
        };
        let resolved = resolve(&auth, "device-1", 1_700_000_000).unwrap();
        match resolved {
            ConnectAuth::SharedSecret(_, headers) => {
                assert_eq!(headers.len(), 4);
                assert!(headers.iter().any(|(k, _)| k == "x-nh-alg"));
            }
            ConnectAuth::MutualTls(_) => panic!("expected shared secret"),
        }
    }
}
