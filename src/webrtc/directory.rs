//! Signaling directory: channel resolution and ICE server vending

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::config::IceServer;
use crate::config::{CredentialCell, Role};
use crate::error::{AppError, Result};

/// Endpoints resolved for one channel, immutable for the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEndpoints {
    /// Channel handle assigned by the directory
    pub channel_id: String,
    /// HTTPS endpoint used for ICE server lookups
    pub control_endpoint: String,
    /// WebSocket endpoint of the signaling relay
    pub signaling_endpoint: String,
}

/// Resolves a channel name to its endpoints
#[async_trait]
pub trait ChannelResolver: Send + Sync {
    async fn resolve(
        &self,
        channel: &str,
        role: Role,
        credentials: &CredentialCell,
    ) -> Result<ChannelEndpoints>;
}

/// Vends relay (TURN) servers for a resolved channel
#[async_trait]
pub trait IceServerDirectory: Send + Sync {
    async fn fetch_ice_servers(
        &self,
        endpoints: &ChannelEndpoints,
        client_id: Option<&str>,
        credentials: &CredentialCell,
    ) -> Result<Vec<IceServer>>;
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeChannelRequest<'a> {
    channel_name: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeChannelResponse {
    channel_info: ChannelInfo,
}

#[derive(Deserialize)]
struct ChannelInfo {
    #[serde(rename = "ChannelARN")]
    channel_arn: String,
}

#[derive(Serialize)]
struct EndpointRequest<'a> {
    #[serde(rename = "ChannelARN")]
    channel_arn: &'a str,
    #[serde(rename = "SingleMasterChannelEndpointConfiguration")]
    configuration: EndpointConfiguration<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointConfiguration<'a> {
    protocols: [&'a str; 2],
    role: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EndpointResponse {
    resource_endpoint_list: Vec<ResourceEndpoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResourceEndpoint {
    protocol: String,
    resource_endpoint: String,
}

#[derive(Serialize)]
struct IceConfigRequest<'a> {
    #[serde(rename = "ChannelARN")]
    channel_arn: &'a str,
    #[serde(rename = "ClientId", skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IceConfigResponse {
    #[serde(default)]
    ice_server_list: Vec<VendedIceServer>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VendedIceServer {
    uris: Vec<String>,
    username: String,
    password: String,
}

/// HTTP JSON client for the signaling directory
pub struct HttpChannelDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpChannelDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn post_json<B, T>(&self, url: &str, body: &B, credentials: &CredentialCell) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.client.post(url).json(body);
        if let Some(creds) = credentials.get() {
            creds.ensure_usable()?;
            request = request.bearer_auth(&creds.token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::DirectoryUnavailable(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    AppError::Credential(format!("{} rejected credentials ({})", url, status))
                }
                StatusCode::NOT_FOUND => AppError::ChannelResolution(format!("{}: {}", url, body)),
                _ => AppError::DirectoryUnavailable(format!("{} returned {}: {}", url, status, body)),
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| AppError::DirectoryUnavailable(format!("invalid response from {}: {}", url, e)))
    }
}

#[async_trait]
impl ChannelResolver for HttpChannelDirectory {
    async fn resolve(
        &self,
        channel: &str,
        role: Role,
        credentials: &CredentialCell,
    ) -> Result<ChannelEndpoints> {
        let describe: DescribeChannelResponse = self
            .post_json(
                &format!("{}/describeSignalingChannel", self.base_url),
                &DescribeChannelRequest {
                    channel_name: channel,
                },
                credentials,
            )
            .await
            .map_err(|e| match e {
                AppError::DirectoryUnavailable(msg) => AppError::ChannelResolution(msg),
                other => other,
            })?;
        let channel_id = describe.channel_info.channel_arn;
        debug!("Channel {} has handle {}", channel, channel_id);

        let endpoints: EndpointResponse = self
            .post_json(
                &format!("{}/getSignalingChannelEndpoint", self.base_url),
                &EndpointRequest {
                    channel_arn: &channel_id,
                    configuration: EndpointConfiguration {
                        protocols: ["WSS", "HTTPS"],
                        role: role.channel_role(),
                    },
                },
                credentials,
            )
            .await?;

        let find = |protocol: &str| {
            endpoints
                .resource_endpoint_list
                .iter()
                .find(|e| e.protocol.eq_ignore_ascii_case(protocol))
                .map(|e| e.resource_endpoint.clone())
                .ok_or_else(|| {
                    AppError::ChannelResolution(format!(
                        "no {} endpoint for channel {}",
                        protocol, channel
                    ))
                })
        };

        Ok(ChannelEndpoints {
            control_endpoint: find("HTTPS")?,
            signaling_endpoint: find("WSS")?,
            channel_id,
        })
    }
}

#[async_trait]
impl IceServerDirectory for HttpChannelDirectory {
    async fn fetch_ice_servers(
        &self,
        endpoints: &ChannelEndpoints,
        client_id: Option<&str>,
        credentials: &CredentialCell,
    ) -> Result<Vec<IceServer>> {
        let url = format!(
            "{}/v1/get-ice-server-config",
            endpoints.control_endpoint.trim_end_matches('/')
        );
        let response: IceConfigResponse = self
            .post_json(
                &url,
                &IceConfigRequest {
                    channel_arn: &endpoints.channel_id,
                    client_id,
                },
                credentials,
            )
            .await?;

        Ok(response
            .ice_server_list
            .into_iter()
            .map(|s| IceServer::relay(s.uris, s.username, s.password))
            .collect())
    }
}
