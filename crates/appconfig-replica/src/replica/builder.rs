//! Builds replica clients from a store's connection configuration.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::client::ReplicaClient;
use crate::service::{ConfigurationError, StoreConfig};
use crate::transport::{ReplicaTarget, TransportProvider};

const ENDPOINT_SECTION: &str = "Endpoint";
const ID_SECTION: &str = "Id";
const SECRET_SECTION: &str = "Secret";

/// Parsed `Endpoint=...;Id=...;Secret=...` connection string.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    /// Normalised endpoint URL.
    pub endpoint: String,
    /// Access key identifier.
    pub id: String,
    /// Base64 access key secret.
    pub secret: String,
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("endpoint", &self.endpoint)
            .field("id", &self.id)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl ConnectionString {
    /// Parses a connection string; every section is mandatory.
    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        let mut endpoint = None;
        let mut id = None;
        let mut secret = None;

        for section in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            // Secrets are base64 and may end in '=', so only split on the first one.
            let (name, value) = section.split_once('=').ok_or_else(|| {
                ConfigurationError::MalformedConnectionString(format!(
                    "section without '=': {section}"
                ))
            })?;
            let slot = match name.trim() {
                ENDPOINT_SECTION => &mut endpoint,
                ID_SECTION => &mut id,
                SECRET_SECTION => &mut secret,
                other => {
                    return Err(ConfigurationError::MalformedConnectionString(format!(
                        "unknown section {other}"
                    )))
                }
            };
            let value = value.trim();
            if value.is_empty() {
                return Err(ConfigurationError::MalformedConnectionString(format!(
                    "empty value for {}",
                    name.trim()
                )));
            }
            *slot = Some(value.to_string());
        }

        let missing =
            |name: &str| ConfigurationError::MalformedConnectionString(format!("missing {name}"));
        Ok(Self {
            endpoint: normalize_endpoint(&endpoint.ok_or_else(|| missing(ENDPOINT_SECTION))?),
            id: id.ok_or_else(|| missing(ID_SECTION))?,
            secret: secret.ok_or_else(|| missing(SECRET_SECTION))?,
        })
    }
}

/// Trims whitespace and trailing slashes so endpoints compare reliably.
pub fn normalize_endpoint(endpoint: &str) -> String {
    endpoint.trim().trim_end_matches('/').to_string()
}

/// Resolves the replica targets of `store` in configured order.
pub(crate) fn replica_targets(
    store: &StoreConfig,
) -> Result<Vec<ReplicaTarget>, ConfigurationError> {
    store.connection_method()?;
    if let Some(raw) = &store.connection_string {
        return Ok(vec![target_from_connection_string(raw)?]);
    }
    if !store.connection_strings.is_empty() {
        return store
            .connection_strings
            .iter()
            .map(|raw| target_from_connection_string(raw))
            .collect();
    }
    Ok(store
        .configured_endpoints()?
        .into_iter()
        .map(|endpoint| ReplicaTarget {
            endpoint,
            connection_string: None,
        })
        .collect())
}

fn target_from_connection_string(raw: &str) -> Result<ReplicaTarget, ConfigurationError> {
    let parsed = ConnectionString::parse(raw)?;
    Ok(ReplicaTarget {
        endpoint: parsed.endpoint.clone(),
        connection_string: Some(parsed),
    })
}

/// Connects one client per replica of `store`.
pub(crate) fn build_clients(
    store: &StoreConfig,
    provider: &dyn TransportProvider,
) -> Result<Vec<Arc<ReplicaClient>>, ConfigurationError> {
    let targets = replica_targets(store)?;
    let mut clients = Vec::with_capacity(targets.len());
    for target in &targets {
        let transport = provider.connect(target)?;
        debug!(endpoint = %target.endpoint, "app-configuration: built replica client");
        clients.push(Arc::new(ReplicaClient::new(target.endpoint.clone(), transport)));
    }
    Ok(clients)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::test_support::MockProvider;

    #[test]
    fn parses_connection_string_with_padded_secret() {
        let parsed =
            ConnectionString::parse("Endpoint=https://store.azconfig.io/;Id=abc;Secret=c2VjcmV0==")
                .unwrap();
        assert_eq!(parsed.endpoint, "https://store.azconfig.io");
        assert_eq!(parsed.id, "abc");
        assert_eq!(parsed.secret, "c2VjcmV0==");
    }

    #[test]
    fn rejects_incomplete_connection_strings() {
        for raw in [
            "",
            "Endpoint=https://store.azconfig.io;Id=abc",
            "Endpoint=https://store.azconfig.io;Id=abc;Secret=",
            "Endpoint=https://store.azconfig.io;Id=abc;Secret=s;Extra=1",
            "Endpoint",
        ] {
            assert!(
                matches!(
                    ConnectionString::parse(raw),
                    Err(ConfigurationError::MalformedConnectionString(_))
                ),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn debug_output_hides_secret() {
        let parsed =
            ConnectionString::parse("Endpoint=https://store.azconfig.io;Id=abc;Secret=hunter2")
                .unwrap();
        let rendered = format!("{parsed:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("https://store.azconfig.io"));
    }

    #[test]
    fn builds_one_client_per_replica_in_order() {
        let store = StoreConfig {
            connection_strings: vec![
                "Endpoint=https://a.azconfig.io;Id=1;Secret=s".into(),
                "Endpoint=https://b.azconfig.io;Id=2;Secret=s".into(),
            ],
            ..Default::default()
        };
        let provider = MockProvider::default();
        let clients = build_clients(&store, &provider).unwrap();
        let endpoints: Vec<_> = clients.iter().map(|c| c.endpoint().to_string()).collect();
        assert_eq!(endpoints, ["https://a.azconfig.io", "https://b.azconfig.io"]);
        assert_eq!(provider.connected_targets().len(), 2);
        assert!(provider.connected_targets()[0].connection_string.is_some());
    }

    #[test]
    fn connection_string_and_endpoint_together_fail_to_build() {
        let store = StoreConfig {
            endpoint: Some("https://a.azconfig.io".into()),
            connection_string: Some("Endpoint=https://a.azconfig.io;Id=1;Secret=s".into()),
            ..Default::default()
        };
        let provider = MockProvider::default();
        assert_eq!(
            build_clients(&store, &provider).err(),
            Some(ConfigurationError::MultipleConnectionMethods)
        );
        assert!(provider.connected_targets().is_empty());
    }
}
