use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, warn};

/// Basic-auth credentials for gateway calls
#[derive(Debug, Clone, Copy)]
pub struct BasicAuth<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// JSON client for one gateway, with bounded exponential-backoff retries
#[derive(Clone)]
pub struct PaymentHttpClient {
    gateway: &'static str,
    client: Client,
    max_retries: u32,
}

/// Whether a request may be sent again once the gateway might have seen it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// Reads, and writes the gateway deduplicates on its own
    Safe,
    /// Resent only when the gateway cannot have acted on it
    Unsafe,
}

impl Replay {
    fn allows(self, may_have_arrived: bool) -> bool {
        self == Replay::Safe || !may_have_arrived
    }
}

enum Attempt<T> {
    Done(PaymentResult<T>),
    Retry(PaymentError),
}

impl PaymentHttpClient {
    pub fn new(gateway: &'static str, timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::Misconfigured(format!("HTTP client: {}", e)))?;

        Ok(Self {
            gateway,
            client,
            max_retries,
        })
    }

    /// Retries rate limits and connection failures. 5xx responses and other
    /// transport failures are retried only for `Replay::Safe` requests.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        auth: BasicAuth<'_>,
        body: Option<&JsonValue>,
        replay: Replay,
    ) -> PaymentResult<T> {
        let mut attempt = 0;
        loop {
            let error = match self.send_once(method.clone(), url, auth, body, replay).await {
                Attempt::Done(result) => return result,
                Attempt::Retry(error) => error,
            };
            if attempt >= self.max_retries {
                return Err(error);
            }

            let delay = backoff(attempt);
            warn!(
                gateway = self.gateway,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "gateway call failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        auth: BasicAuth<'_>,
        body: Option<&JsonValue>,
        replay: Replay,
    ) -> Attempt<T> {
        let mut request = self
            .client
            .request(method, url)
            .basic_auth(auth.username, Some(auth.password));
        if let Some(payload) = body {
            request = request.json(payload);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let error = PaymentError::Unavailable {
                    gateway: self.gateway.to_string(),
                    message: e.to_string(),
                };
                return if replay.allows(!e.is_connect()) {
                    Attempt::Retry(error)
                } else {
                    Attempt::Done(Err(error))
                };
            }
        };

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        debug!(gateway = self.gateway, status = status.as_u16(), "gateway responded");

        if status.is_success() {
            return Attempt::Done(serde_json::from_str::<T>(&text).map_err(|e| {
                PaymentError::MalformedResponse {
                    gateway: self.gateway.to_string(),
                    message: e.to_string(),
                }
            }));
        }

        let error = classify_status(self.gateway, status, text);
        if error.is_retryable() && replay.allows(status != StatusCode::TOO_MANY_REQUESTS) {
            Attempt::Retry(error)
        } else {
            Attempt::Done(Err(error))
        }
    }
}

fn classify_status(gateway: &str, status: StatusCode, body: String) -> PaymentError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return PaymentError::RateLimited {
            gateway: gateway.to_string(),
        };
    }
    PaymentError::Rejected {
        gateway: gateway.to_string(),
        status: status.as_u16(),
        message: body,
    }
}

/// 500ms, 1s, 2s, ... capped at 8s
fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500u64.saturating_mul(1 << attempt.min(4)))
}

/// Lowercase hex HMAC-SHA256 of `payload`
pub fn hmac_sha256_hex(payload: &[u8], secret: &str) -> Option<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a hex signature; an empty secret never verifies
pub fn verify_hmac_sha256_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(expected) = hmac_sha256_hex(payload, secret) else {
        return false;
    };
    let given = signature.trim().to_ascii_lowercase();
    expected.len() == given.len()
        && expected
            .bytes()
            .zip(given.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(0), Duration::from_millis(500));
        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(4));
        assert_eq!(backoff(9), Duration::from_secs(8));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status("razorpay", StatusCode::TOO_MANY_REQUESTS, String::new()),
            PaymentError::RateLimited { .. }
        ));
        assert!(classify_status("razorpay", StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(!classify_status("razorpay", StatusCode::BAD_REQUEST, String::new()).is_retryable());
    }

    #[test]
    fn unsafe_requests_are_resent_only_when_never_delivered() {
        assert!(Replay::Safe.allows(true));
        assert!(Replay::Safe.allows(false));
        assert!(Replay::Unsafe.allows(false));
        assert!(!Replay::Unsafe.allows(true));
    }

    #[tokio::test]
    async fn unsafe_request_is_not_resent_after_a_server_error() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let served = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                served.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 502 Bad Gateway\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
            }
        });

        let client = PaymentHttpClient::new("razorpay", Duration::from_secs(5), 3).unwrap();
        let auth = BasicAuth {
            username: "key",
            password: "secret",
        };
        let url = format!("http://{}/payments/pay_1/refund", addr);
        let result: PaymentResult<JsonValue> = client
            .request_json(Method::POST, &url, auth, None, Replay::Unsafe)
            .await;

        assert!(result.is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn webhook_hmac_verification() {
        let payload = br#"{"event":"payment.captured"}"#;
        let signature = hmac_sha256_hex(payload, "whsec").unwrap();

        assert!(verify_hmac_sha256_hex(payload, "whsec", &signature));
        assert!(verify_hmac_sha256_hex(
            payload,
            "whsec",
            &signature.to_uppercase()
        ));
        assert!(!verify_hmac_sha256_hex(payload, "other", &signature));
        assert!(!verify_hmac_sha256_hex(payload, "", &signature));
        assert!(!verify_hmac_sha256_hex(payload, "whsec", "not-a-valid-signature"));
    }
}
