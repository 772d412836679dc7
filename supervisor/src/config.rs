use std::collections::HashMap;

use consumer_supervisor::{Error, Result};
use consumer_supervisor_kafka::{KafkaAuth, KafkaReaderConfig, TlsClientAuthCerts, TlsConfig};

const DEFAULT_GROUP_ID: &str = "consumer-supervisor";

const ENV_KAFKA_BROKERS: &str = "SUPERVISOR_KAFKA_BROKERS";
const ENV_KAFKA_GROUP_ID: &str = "SUPERVISOR_KAFKA_GROUP_ID";
const ENV_KAFKA_SASL_MECHANISM: &str = "SUPERVISOR_KAFKA_SASL_MECHANISM";
const ENV_KAFKA_SASL_USERNAME: &str = "SUPERVISOR_KAFKA_SASL_USERNAME";
const ENV_KAFKA_SASL_PASSWORD: &str = "SUPERVISOR_KAFKA_SASL_PASSWORD";
const ENV_KAFKA_TLS_CA_CERT: &str = "SUPERVISOR_KAFKA_TLS_CA_CERT";
const ENV_KAFKA_TLS_CLIENT_CERT: &str = "SUPERVISOR_KAFKA_TLS_CLIENT_CERT";
const ENV_KAFKA_TLS_CLIENT_KEY: &str = "SUPERVISOR_KAFKA_TLS_CLIENT_KEY";
const ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY: &str = "SUPERVISOR_KAFKA_TLS_INSECURE_SKIP_VERIFY";

/// Kafka connection settings, from the environment.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Settings {
    pub(crate) kafka: KafkaReaderConfig,
}

impl Settings {
    pub(crate) fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _val)| key.starts_with("SUPERVISOR_KAFKA_"))
            .collect();

        let get_var = |var: &str| -> Result<String> {
            Ok(env_vars
                .get(var)
                .ok_or_else(|| Error::Config(format!("Environment variable {var} is not set")))?
                .to_string())
        };

        let brokers: Vec<String> = get_var(ENV_KAFKA_BROKERS)?
            .split(',')
            .map(str::trim)
            .filter(|broker| !broker.is_empty())
            .map(String::from)
            .collect();
        if brokers.is_empty() {
            return Err(Error::Config(format!(
                "{ENV_KAFKA_BROKERS} does not list any broker"
            )));
        }

        let auth = match get_var(ENV_KAFKA_SASL_MECHANISM).ok() {
            Some(mechanism) => Some(KafkaAuth::Sasl {
                mechanism,
                username: get_var(ENV_KAFKA_SASL_USERNAME)?,
                password: get_var(ENV_KAFKA_SASL_PASSWORD)?,
            }),
            None => None,
        };

        let insecure_skip_verify = match get_var(ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY).ok() {
            Some(value) => value.parse::<bool>().map_err(|e| {
                Error::Config(format!(
                    "Invalid {ENV_KAFKA_TLS_INSECURE_SKIP_VERIFY}={value}: {e}"
                ))
            })?,
            None => false,
        };
        let ca_cert = get_var(ENV_KAFKA_TLS_CA_CERT).ok();
        let client_auth = match (
            get_var(ENV_KAFKA_TLS_CLIENT_CERT).ok(),
            get_var(ENV_KAFKA_TLS_CLIENT_KEY).ok(),
        ) {
            (Some(client_cert), Some(client_cert_private_key)) => Some(TlsClientAuthCerts {
                client_cert,
                client_cert_private_key,
            }),
            (None, None) => None,
            _ => {
                return Err(Error::Config(format!(
                    "{ENV_KAFKA_TLS_CLIENT_CERT} and {ENV_KAFKA_TLS_CLIENT_KEY} must be set together"
                )));
            }
        };
        let tls = if insecure_skip_verify || ca_cert.is_some() || client_auth.is_some() {
            Some(TlsConfig {
                insecure_skip_verify,
                ca_cert,
                client_auth,
            })
        } else {
            None
        };

        Ok(Self {
            kafka: KafkaReaderConfig {
                brokers,
                group_id: get_var(ENV_KAFKA_GROUP_ID)
                    .unwrap_or_else(|_| DEFAULT_GROUP_ID.to_string()),
                auth,
                tls,
            },
        })
    }
}
