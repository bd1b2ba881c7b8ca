// Hub identity registry HTTP client
//
// Service-side REST surface of the hub: list device identities and
// create (or replace) a device identity with a symmetric key pair.
// Every request is signed with a short-lived SAS token derived from
// the shared access policy in the hub connection string.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::connection_string::HubConnectionString;
use crate::error::Error;
use crate::sas;
use crate::transport::TransportConfig;

/// Service API version sent with every registry request.
pub const REGISTRY_API_VERSION: &str = "2021-04-12";

/// Page size for identity listing.
pub const DEFAULT_LIST_TOP: usize = 1000;

// ── Wire types ───────────────────────────────────────────────────────

/// A device identity as returned by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    /// `"enabled"` or `"disabled"`.
    pub status: String,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub connection_state: Option<String>,
    #[serde(default)]
    pub last_activity_time: Option<DateTime<Utc>>,
}

/// Request body for creating or replacing a device identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDeviceIdentity {
    pub device_id: String,
    pub status: String,
    pub authentication: Authentication,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Authentication {
    #[serde(rename = "type")]
    pub kind: String,
    pub symmetric_key: SymmetricKey,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymmetricKey {
    pub primary_key: String,
    pub secondary_key: String,
}

impl NewDeviceIdentity {
    /// A SAS-authenticated identity with the given key pair.
    pub fn with_symmetric_key(
        device_id: impl Into<String>,
        status: impl Into<String>,
        primary_key: impl Into<String>,
        secondary_key: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            status: status.into(),
            authentication: Authentication {
                kind: "sas".into(),
                symmetric_key: SymmetricKey {
                    primary_key: primary_key.into(),
                    secondary_key: secondary_key.into(),
                },
            },
        }
    }
}

/// Error body shape used by the hub service API.
#[derive(Deserialize)]
struct HubErrorBody {
    #[serde(rename = "Message", alias = "message")]
    message: Option<String>,
}

// ── Client ───────────────────────────────────────────────────────────

/// Raw HTTP client for the hub's identity registry.
pub struct RegistryClient {
    http: reqwest::Client,
    base_url: Url,
    host_name: String,
    key_name: String,
    key: SecretString,
}

impl RegistryClient {
    /// Create a registry client for the hub named in `connection`.
    pub fn new(connection: &HubConnectionString, transport: &TransportConfig) -> Result<Self, Error> {
        let base_url = Url::parse(&format!("https://{}", connection.host_name))?;
        let http = transport.build_client()?;
        Ok(Self::with_client(http, base_url, connection))
    }

    /// Create a registry client with a pre-built `reqwest::Client` and an
    /// explicit base URL (tests point this at a mock server).
    pub fn with_client(http: reqwest::Client, base_url: Url, connection: &HubConnectionString) -> Self {
        Self {
            http,
            base_url,
            host_name: connection.host_name.clone(),
            key_name: connection.key_name.clone(),
            key: connection.key.clone(),
        }
    }

    /// The hub host name this client signs tokens for.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// List up to `top` device identities.
    pub async fn list_devices(&self, top: usize) -> Result<Vec<DeviceIdentity>, Error> {
        let mut url = self.url(&["devices"]);
        url.query_pairs_mut().append_pair("top", &top.to_string());
        debug!("GET {}", url);

        let resp = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, self.token()?)
            .send()
            .await?;

        parse_json(resp).await
    }

    /// Create a device identity, replacing it if it already exists.
    ///
    /// A plain `PUT` creates; when the registry answers 409 the request is
    /// repeated once with `If-Match: "*"`, which overwrites the existing
    /// identity (including its keys).
    pub async fn create_or_update_device(
        &self,
        device: &NewDeviceIdentity,
    ) -> Result<DeviceIdentity, Error> {
        let url = self.url(&["devices", &device.device_id]);
        debug!("PUT {}", url);

        let resp = self
            .http
            .put(url.clone())
            .header(reqwest::header::AUTHORIZATION, self.token()?)
            .json(device)
            .send()
            .await?;

        if resp.status() != StatusCode::CONFLICT {
            return parse_json(resp).await;
        }

        debug!(device_id = %device.device_id, "identity exists, replacing");
        let resp = self
            .http
            .put(url)
            .header(reqwest::header::AUTHORIZATION, self.token()?)
            .header(reqwest::header::IF_MATCH, "\"*\"")
            .json(device)
            .send()
            .await?;

        parse_json(resp).await
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// `{base}/{segments...}?api-version=...`, with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url.query_pairs_mut()
            .append_pair("api-version", REGISTRY_API_VERSION);
        url
    }

    fn token(&self) -> Result<String, Error> {
        sas::generate_token(
            &self.host_name,
            &self.key,
            Some(&self.key_name),
            sas::DEFAULT_TOKEN_TTL,
        )
    }
}

/// Map the status code, then deserialize the body.
async fn parse_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, Error> {
    let status = resp.status();

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::Authentication {
            message: format!("registry rejected credentials (HTTP {})", status.as_u16()),
        });
    }

    let body = resp.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<HubErrorBody>(&body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or_else(|| body.chars().take(200).collect());
        return Err(Error::Hub {
            message,
            status: status.as_u16(),
        });
    }

    serde_json::from_str(&body).map_err(|e| {
        let preview: String = body.chars().take(200).collect();
        Error::Deserialization {
            message: format!("{e} (body preview: {preview:?})"),
            body: body.clone(),
        }
    })
}
