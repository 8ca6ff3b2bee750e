//! Client for the Lemur certificate API, used by the `lemur-signer` binary.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Default timeout for a signing request.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Errors from the Lemur API.
#[derive(Error, Debug)]
pub enum LemurError {
    /// Transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Lemur answered with anything but 200.
    #[error("lemur returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Response lacks a certificate body.
    #[error("lemur response has no certificate body")]
    MissingBody,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SigningRequest {
    pub owner: String,
    pub common_name: String,
    pub validity_years: u32,
    pub notify: bool,
    pub csr: String,
    pub authority: Authority,
    pub extensions: Extensions,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Authority {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Extensions {
    pub sub_alt_names: SubAltNames,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubAltNames {
    pub names: Vec<SubAltName>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubAltName {
    pub name_type: String,
    pub value: String,
}

impl SigningRequest {
    /// Request with the common name doubling as the single DNS SAN.
    #[must_use]
    pub fn new(
        csr: impl Into<String>,
        common_name: impl Into<String>,
        owner: impl Into<String>,
        authority: impl Into<String>,
        validity_years: u32,
        notify: bool,
    ) -> Self {
        let common_name = common_name.into();
        Self {
            owner: owner.into(),
            validity_years,
            notify,
            csr: csr.into(),
            authority: Authority {
                name: authority.into(),
            },
            extensions: Extensions {
                sub_alt_names: SubAltNames {
                    names: vec![SubAltName {
                        name_type: "DNSName".to_string(),
                        value: common_name.clone(),
                    }],
                },
            },
            common_name,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigningResponse {
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub chain: String,
}

impl SigningResponse {
    /// Leaf followed by the chain, each newline-terminated.
    #[must_use]
    pub fn pem(&self) -> String {
        format!("{}\n{}\n", self.body, self.chain)
    }
}

/// Lemur API client.
#[derive(Debug, Clone)]
pub struct LemurClient {
    client: Client,
    endpoint: String,
    token: String,
}

impl LemurClient {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        insecure: bool,
    ) -> Result<Self, LemurError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(insecure)
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token: token.into(),
        })
    }

    /// Submit a CSR and return the signed PEM chain.
    ///
    /// # Errors
    ///
    /// Returns [`LemurError`] on transport failure, a non-200 status or a
    /// response without a certificate body.
    pub async fn sign(&self, request: &SigningRequest) -> Result<String, LemurError> {
        debug!(
            endpoint = %self.endpoint,
            common_name = %request.common_name,
            authority = %request.authority.name,
            "Submitting CSR to lemur"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let message = response.text().await.unwrap_or_default();
            return Err(LemurError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let signed: SigningResponse = response.json().await?;
        if signed.body.trim().is_empty() {
            return Err(LemurError::MissingBody);
        }
        Ok(signed.pem())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> SigningRequest {
        SigningRequest::new("CSR", "bmc-1.example.net", "ops@example.net", "internal-ca", 1, false)
    }

    #[test]
    fn test_request_wire_format() {
        let json = serde_json::to_value(request()).unwrap();
        assert_eq!(json["commonName"], "bmc-1.example.net");
        assert_eq!(json["validityYears"], 1);
        assert_eq!(json["authority"]["name"], "internal-ca");
        assert_eq!(
            json["extensions"]["subAltNames"]["names"][0]["nameType"],
            "DNSName"
        );
        assert_eq!(
            json["extensions"]["subAltNames"]["names"][0]["value"],
            "bmc-1.example.net"
        );
    }

    #[tokio::test]
    async fn test_sign_returns_body_and_chain() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/1/certificates"))
            .and(header("Authorization", "Bearer tok"))
            .and(body_partial_json(serde_json::json!({"owner": "ops@example.net"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "body": "LEAF",
                "chain": "CHAIN"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client =
            LemurClient::new(format!("{}/api/1/certificates", server.uri()), "tok", false).unwrap();
        let pem = client.sign(&request()).await.unwrap();
        assert_eq!(pem, "LEAF\nCHAIN\n");
    }

    #[tokio::test]
    async fn test_sign_rejects_non_200() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created elsewhere"))
            .mount(&server)
            .await;

        let client = LemurClient::new(server.uri(), "tok", false).unwrap();
        let err = client.sign(&request()).await.unwrap_err();
        assert!(matches!(err, LemurError::Api { status: 201, .. }));
    }

    #[tokio::test]
    async fn test_sign_requires_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "chain": "CHAIN"
            })))
            .mount(&server)
            .await;

        let client = LemurClient::new(server.uri(), "tok", false).unwrap();
        let err = client.sign(&request()).await.unwrap_err();
        assert!(matches!(err, LemurError::MissingBody));
    }
}
