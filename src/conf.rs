use crate::processor::DEFAULT_PROCESSOR_NAME;
use anyhow::{Context, bail};
use std::fmt;
use std::time::Duration;

const SECURITY_PROTOCOLS: &[&str] = &["PLAINTEXT", "SSL", "SASL_PLAINTEXT", "SASL_SSL"];
const OFFSET_RESETS: &[&str] = &["earliest", "latest"];

/// Client-credentials settings handed to librdkafka's OIDC token provider.
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthConfig {
    pub token_endpoint_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

impl fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("token_endpoint_url", &self.token_endpoint_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .field("scope", &self.scope)
            .finish()
    }
}

/// Trust material paths, all PEM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
    pub endpoint_identification_algorithm: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bootstrap_servers: String,
    pub source_topic: String,
    pub target_topic: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
    pub security_protocol: String,
    pub oauth: Option<OAuthConfig>,
    pub tls: TlsConfig,
    pub delivery_timeout: Duration,
    pub processor_name: String,
    pub health_port: u16,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required(name: &str) -> anyhow::Result<String> {
    var(name).with_context(|| format!("{name} environment variable not set"))
}

fn parsed<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{name} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

impl Config {
    /// Build a configuration from environment variables.
    ///
    /// Required variables: `KAFKA_BOOTSTRAP_SERVERS`, plus `OAUTH_CLIENT_ID` and
    /// `OAUTH_CLIENT_SECRET` whenever `OAUTH_TOKEN_ENDPOINT_URL` is set.
    ///
    /// # Errors
    /// Returns an error if a required variable is missing, a numeric variable
    /// does not parse, or the security settings are inconsistent.
    pub fn from_env() -> anyhow::Result<Self> {
        let oauth = match var("OAUTH_TOKEN_ENDPOINT_URL") {
            Some(token_endpoint_url) => Some(OAuthConfig {
                token_endpoint_url,
                client_id: required("OAUTH_CLIENT_ID")?,
                client_secret: required("OAUTH_CLIENT_SECRET")?,
                scope: var("OAUTH_SCOPE"),
            }),
            None => None,
        };

        let default_protocol = if oauth.is_some() {
            "SASL_SSL"
        } else {
            "PLAINTEXT"
        };

        let config = Self {
            bootstrap_servers: required("KAFKA_BOOTSTRAP_SERVERS")?,
            source_topic: var("SOURCE_TOPIC").unwrap_or_else(|| "source-events".to_string()),
            target_topic: var("TARGET_TOPIC").unwrap_or_else(|| "target-events".to_string()),
            consumer_group: var("CONSUMER_GROUP")
                .unwrap_or_else(|| "kafka-oauth-relay".to_string()),
            auto_offset_reset: var("AUTO_OFFSET_RESET")
                .map_or_else(|| "latest".to_string(), |v| v.to_lowercase()),
            security_protocol: var("KAFKA_SECURITY_PROTOCOL")
                .map_or_else(|| default_protocol.to_string(), |v| v.to_uppercase()),
            oauth,
            tls: TlsConfig {
                ca_location: var("SSL_CA_LOCATION"),
                certificate_location: var("SSL_CERTIFICATE_LOCATION"),
                key_location: var("SSL_KEY_LOCATION"),
                endpoint_identification_algorithm: var("SSL_ENDPOINT_IDENTIFICATION_ALGORITHM"),
            },
            delivery_timeout: Duration::from_millis(parsed("DELIVERY_TIMEOUT_MS", 30_000)?),
            processor_name: var("PROCESSOR_NAME")
                .unwrap_or_else(|| DEFAULT_PROCESSOR_NAME.to_string()),
            health_port: parsed("HEALTH_PORT", 8080)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !SECURITY_PROTOCOLS.contains(&self.security_protocol.as_str()) {
            bail!(
                "KAFKA_SECURITY_PROTOCOL must be one of {}, got {}",
                SECURITY_PROTOCOLS.join(", "),
                self.security_protocol
            );
        }
        if self.oauth.is_some() && !self.security_protocol.starts_with("SASL_") {
            bail!(
                "OAUTH_TOKEN_ENDPOINT_URL requires a SASL security protocol, got {}",
                self.security_protocol
            );
        }
        if !OFFSET_RESETS.contains(&self.auto_offset_reset.as_str()) {
            bail!(
                "AUTO_OFFSET_RESET must be one of {}, got {}",
                OFFSET_RESETS.join(", "),
                self.auto_offset_reset
            );
        }
        if self.tls.certificate_location.is_some() != self.tls.key_location.is_some() {
            bail!("SSL_CERTIFICATE_LOCATION and SSL_KEY_LOCATION must be set together");
        }
        if self.source_topic == self.target_topic {
            bail!(
                "SOURCE_TOPIC and TARGET_TOPIC must differ, both are {}",
                self.source_topic
            );
        }
        Ok(())
    }

    /// librdkafka properties for the source consumer. Offsets are committed
    /// by the relay after delivery, never automatically.
    pub fn consumer_settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = self.connection_settings();
        settings.extend([
            ("group.id", self.consumer_group.clone()),
            ("client.id", format!("{}-consumer", self.processor_name)),
            ("enable.auto.commit", "false".to_string()),
            ("auto.offset.reset", self.auto_offset_reset.clone()),
            ("enable.partition.eof", "false".to_string()),
        ]);
        settings
    }

    /// librdkafka properties for the target producer.
    pub fn producer_settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = self.connection_settings();
        settings.extend([
            ("client.id", format!("{}-producer", self.processor_name)),
            (
                "message.timeout.ms",
                self.delivery_timeout.as_millis().to_string(),
            ),
        ]);
        settings
    }

    fn connection_settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = vec![
            ("bootstrap.servers", self.bootstrap_servers.clone()),
            ("security.protocol", self.security_protocol.clone()),
        ];

        if let Some(oauth) = &self.oauth {
            settings.extend([
                ("sasl.mechanism", "OAUTHBEARER".to_string()),
                ("sasl.oauthbearer.method", "oidc".to_string()),
                (
                    "sasl.oauthbearer.token.endpoint.url",
                    oauth.token_endpoint_url.clone(),
                ),
                ("sasl.oauthbearer.client.id", oauth.client_id.clone()),
                ("sasl.oauthbearer.client.secret", oauth.client_secret.clone()),
            ]);
            if let Some(scope) = &oauth.scope {
                settings.push(("sasl.oauthbearer.scope", scope.clone()));
            }
        }

        let tls = [
            ("ssl.ca.location", &self.tls.ca_location),
            ("ssl.certificate.location", &self.tls.certificate_location),
            ("ssl.key.location", &self.tls.key_location),
            (
                "ssl.endpoint.identification.algorithm",
                &self.tls.endpoint_identification_algorithm,
            ),
        ];
        settings.extend(
            tls.into_iter()
                .filter_map(|(key, value)| value.clone().map(|v| (key, v))),
        );

        settings
    }
}
