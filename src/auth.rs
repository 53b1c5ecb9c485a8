//! Connection-string parsing and link authorization (§5, §6). Ported from
//! the teacher's `client::auth::ConnectionConfig`, generalized to parse the
//! full key set of §6 (`EntityPath`, `TransportType`, `OperationTimeout`,
//! a pre-built `SharedAccessSignature`) and to go through the pluggable
//! `TokenProvider` boundary (§1 "out of scope, specified only at the
//! interface") instead of hard-coding Azure AD's `TokenCredential`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Result, ServiceBusError};

type HmacSha256 = Hmac<Sha256>;

const SERVICE_BUS_SCOPE: &str = "https://servicebus.azure.net/.default";
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// A bearer token plus its expiry, returned by a `TokenProvider` (§1, §5).
#[derive(Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

/// On-demand signed-credential issuance for link authorization (§1 "Token
/// Provider Adapter"). A transport crate (or `azure_identity`) implements
/// this; this crate only calls it.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken>;
}

/// Adapts any `azure_core::credentials::TokenCredential` into this crate's
/// `TokenProvider`, matching the teacher's direct use of that trait.
pub struct AzureCoreTokenProvider {
    credential: Arc<dyn azure_core::credentials::TokenCredential>,
}

impl AzureCoreTokenProvider {
    pub fn new(credential: Arc<dyn azure_core::credentials::TokenCredential>) -> Self {
        Self { credential }
    }
}

#[async_trait]
impl TokenProvider for AzureCoreTokenProvider {
    async fn get_token(&self, scopes: &[&str]) -> Result<AccessToken> {
        let token = self
            .credential
            .get_token(scopes)
            .await
            .map_err(|e| ServiceBusError::new(crate::error::ServiceBusErrorKind::Unauthorized, e.to_string()))?;
        Ok(AccessToken {
            token: token.token.secret().to_string(),
            expires_on: token.expires_on,
        })
    }
}

#[derive(Clone)]
pub enum AuthMode {
    Sas {
        shared_access_key_name: String,
        shared_access_key: String,
    },
    /// A pre-minted SAS token carried in the connection string verbatim.
    SharedAccessSignature { token: String },
    AzureAd { provider: Arc<dyn TokenProvider> },
}

impl std::fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sas {
                shared_access_key_name,
                ..
            } => f
                .debug_struct("Sas")
                .field("shared_access_key_name", shared_access_key_name)
                .finish(),
            Self::SharedAccessSignature { .. } => f.write_str("SharedAccessSignature"),
            Self::AzureAd { .. } => f.write_str("AzureAd"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    AmqpTcp,
    AmqpWebSockets,
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub namespace: String,
    pub endpoint: String,
    pub auth_mode: AuthMode,
    /// Present on an entity-scoped connection string (§6).
    pub entity_path: Option<String>,
    pub transport_type: TransportType,
    pub operation_timeout: Duration,
}

impl ConnectionConfig {
    /// Parse `Key=Value;Key=Value` (§6), case-insensitive keys.
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut sas_token = None;
        let mut entity_path = None;
        let mut transport_type = TransportType::AmqpTcp;
        let mut operation_timeout = DEFAULT_OPERATION_TIMEOUT;

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let Some(idx) = part.find('=') else { continue };
            let k = part[..idx].trim();
            let v = part[idx + 1..].trim();
            match k.to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(v.to_string()),
                "sharedaccesskeyname" => key_name = Some(v.to_string()),
                // Key/signature values may contain '=' (base64 padding) — already
                // handled since we only split on the first '='.
                "sharedaccesskey" => key = Some(v.to_string()),
                "sharedaccesssignature" => sas_token = Some(v.to_string()),
                "entitypath" => entity_path = Some(v.to_string()),
                "transporttype" => {
                    transport_type = match v.to_ascii_lowercase().as_str() {
                        "amqpwebsockets" => TransportType::AmqpWebSockets,
                        _ => TransportType::AmqpTcp,
                    };
                }
                "operationtimeout" => {
                    if let Ok(secs) = v.parse::<u64>() {
                        operation_timeout = Duration::from_secs(secs);
                    }
                }
                _ => {}
            }
        }

        let endpoint = endpoint
            .ok_or_else(|| ServiceBusError::argument("connection string missing Endpoint"))?;

        let namespace = endpoint
            .trim_start_matches("sb://")
            .trim_end_matches('/')
            .to_string();
        let https_endpoint = format!("https://{namespace}");

        let auth_mode = if let Some(token) = sas_token {
            AuthMode::SharedAccessSignature { token }
        } else {
            let key_name = key_name.ok_or_else(|| {
                ServiceBusError::argument("connection string missing SharedAccessKeyName")
            })?;
            let key = key
                .ok_or_else(|| ServiceBusError::argument("connection string missing SharedAccessKey"))?;
            AuthMode::Sas {
                shared_access_key_name: key_name,
                shared_access_key: key,
            }
        };

        Ok(Self {
            namespace,
            endpoint: https_endpoint,
            auth_mode,
            entity_path,
            transport_type,
            operation_timeout,
        })
    }

    pub fn from_azure_ad(namespace: &str, provider: Arc<dyn TokenProvider>) -> Self {
        let namespace = namespace
            .trim_start_matches("sb://")
            .trim_end_matches('/')
            .to_string();
        let endpoint = format!("https://{namespace}");
        Self {
            namespace,
            endpoint,
            auth_mode: AuthMode::AzureAd { provider },
            entity_path: None,
            transport_type: TransportType::AmqpTcp,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn is_azure_ad(&self) -> bool {
        matches!(self.auth_mode, AuthMode::AzureAd { .. })
    }

    fn generate_sas_token(
        key_name: &str,
        key: &str,
        resource_uri: &str,
        validity_secs: u64,
    ) -> Result<String> {
        let encoded_uri = urlencoding::encode(resource_uri).to_lowercase();
        let expiry = Utc::now().timestamp() as u64 + validity_secs;
        let string_to_sign = format!("{encoded_uri}\n{expiry}");

        let mut mac = HmacSha256::new_from_slice(key.as_bytes())
            .map_err(|e| ServiceBusError::new(crate::error::ServiceBusErrorKind::Unauthorized, format!("HMAC key error: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        let signature = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        let encoded_signature = urlencoding::encode(&signature);

        Ok(format!(
            "SharedAccessSignature sr={encoded_uri}&sig={encoded_signature}&se={expiry}&skn={key_name}"
        ))
    }

    /// Authorization header scoped to the namespace root.
    pub async fn namespace_token(&self) -> Result<String> {
        match &self.auth_mode {
            AuthMode::Sas {
                shared_access_key_name,
                shared_access_key,
            } => Self::generate_sas_token(shared_access_key_name, shared_access_key, &self.endpoint, 3600),
            AuthMode::SharedAccessSignature { token } => Ok(token.clone()),
            AuthMode::AzureAd { provider } => {
                let token = provider.get_token(&[SERVICE_BUS_SCOPE]).await?;
                Ok(format!("Bearer {}", token.token))
            }
        }
    }

    /// Authorization header scoped to a specific entity.
    pub async fn entity_token(&self, entity_path: &str) -> Result<String> {
        match &self.auth_mode {
            AuthMode::Sas {
                shared_access_key_name,
                shared_access_key,
            } => {
                let uri = format!("{}/{}", self.endpoint, entity_path);
                Self::generate_sas_token(shared_access_key_name, shared_access_key, &uri, 3600)
            }
            AuthMode::SharedAccessSignature { token } => Ok(token.clone()),
            AuthMode::AzureAd { provider } => {
                let token = provider.get_token(&[SERVICE_BUS_SCOPE]).await?;
                Ok(format!("Bearer {}", token.token))
            }
        }
    }
}
