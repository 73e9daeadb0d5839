use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{MtdError, Result};
use crate::models::ServiceId;

const STATUS_OK: u16 = 200;
const STATUS_ACCEPTED: u16 = 202;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTunnel {
    pub incoming_port: u16,
    pub destination_port: u16,
    pub destination_ip: IpAddr,
    pub id: ServiceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyTunnel {
    pub destination_port: u16,
    pub destination_ip: IpAddr,
    pub id: ServiceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTunnel {
    pub id: ServiceId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRequest {}

/// One command to the proxy's `/command` endpoint. Exactly one of the
/// command fields is set; `timestamp` and `signature` are reserved for
/// authenticated commands and left unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create: Option<CreateTunnel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify: Option<ModifyTunnel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<DeleteTunnel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ProxyCommand {
    pub fn create(incoming_port: u16, destination: SocketAddr, id: ServiceId) -> Self {
        Self {
            create: Some(CreateTunnel {
                incoming_port,
                destination_port: destination.port(),
                destination_ip: destination.ip(),
                id,
            }),
            ..Default::default()
        }
    }

    pub fn modify(destination: SocketAddr, id: ServiceId) -> Self {
        Self {
            modify: Some(ModifyTunnel {
                destination_port: destination.port(),
                destination_ip: destination.ip(),
                id,
            }),
            ..Default::default()
        }
    }

    pub fn delete(id: ServiceId) -> Self {
        Self {
            delete: Some(DeleteTunnel { id }),
            ..Default::default()
        }
    }

    pub fn status() -> Self {
        Self {
            status: Some(StatusRequest {}),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> &'static str {
        if self.create.is_some() {
            "create"
        } else if self.modify.is_some() {
            "modify"
        } else if self.delete.is_some() {
            "delete"
        } else {
            "status"
        }
    }

    /// The only status code that counts as success for this command.
    pub fn success_status(&self) -> u16 {
        if self.status.is_some() {
            STATUS_OK
        } else {
            STATUS_ACCEPTED
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: u16,
    pub body: String,
}

/// Delivers one command to a proxy control endpoint and returns the raw
/// response.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send(&self, control: SocketAddr, command: &ProxyCommand) -> Result<ProxyResponse>;
}

/// JSON over HTTP POST to `http://<control>/command`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MtdError::ProxyTransport(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CommandTransport for HttpTransport {
    async fn send(&self, control: SocketAddr, command: &ProxyCommand) -> Result<ProxyResponse> {
        let url = format!("http://{control}/command");
        let response = self
            .client
            .post(&url)
            .json(command)
            .send()
            .await
            .map_err(|e| MtdError::ProxyTransport(format!("error making http request to {url}: {e}")))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| MtdError::ProxyTransport(format!("error reading response: {e}")))?;
        Ok(ProxyResponse { status, body })
    }
}

/// Command channel of the proxy fronting one service.
#[derive(Clone)]
pub struct ProxyClient {
    control: SocketAddr,
    transport: Arc<dyn CommandTransport>,
}

impl ProxyClient {
    pub fn new(control: SocketAddr, transport: Arc<dyn CommandTransport>) -> Self {
        Self { control, transport }
    }

    pub fn control(&self) -> SocketAddr {
        self.control
    }

    /// Open a tunnel from `incoming_port` on the proxy to `destination`.
    pub async fn create(
        &self,
        incoming_port: u16,
        destination: SocketAddr,
        id: ServiceId,
    ) -> Result<()> {
        self.execute(ProxyCommand::create(incoming_port, destination, id))
            .await
            .map(|_| ())
    }

    /// Repoint the tunnel `id` at `destination`.
    pub async fn modify(&self, destination: SocketAddr, id: ServiceId) -> Result<()> {
        self.execute(ProxyCommand::modify(destination, id))
            .await
            .map(|_| ())
    }

    pub async fn delete(&self, id: ServiceId) -> Result<()> {
        self.execute(ProxyCommand::delete(id)).await.map(|_| ())
    }

    /// Returns the proxy's status body.
    pub async fn status(&self) -> Result<String> {
        self.execute(ProxyCommand::status()).await
    }

    async fn execute(&self, command: ProxyCommand) -> Result<String> {
        let response = self.transport.send(self.control, &command).await?;
        if response.status != command.success_status() {
            tracing::debug!(
                control = %self.control,
                command = command.kind(),
                status = response.status,
                "proxy rejected command"
            );
            return Err(MtdError::ProxyRejected {
                status: response.status,
                body: response.body,
            });
        }
        Ok(response.body)
    }
}
