use crate::core::payment::FallbackPolicy;
use bitcoin::secp256k1::PublicKey;
use cln_plugin::{options, Builder, ConfiguredPlugin};
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid value for field {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Plugin option error for {field}: {source}")]
    PluginError {
        field: &'static str,
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    policy: FallbackPolicy,
    trusted_peers: Vec<PublicKey>,
}

impl Config {
    pub fn policy(&self) -> FallbackPolicy {
        self.policy
    }

    /// Peers to open incoming trust for at start-up.
    pub fn trusted_peers(&self) -> &[PublicKey] {
        &self.trusted_peers
    }
}

#[derive(Debug, Clone)]
pub struct Options<'a> {
    pub stop_on_rejection: options::FlagConfigOption<'a>,
    pub trusted_peers: options::StringConfigOption<'a>,
}

impl<'a> Options<'a> {
    pub fn new() -> Self {
        Self {
            stop_on_rejection: options::ConfigOption::new_flag(
                "virtualchannels-stop-on-rejection",
                "Give up on a payment as soon as a virtual channel partner fails to pay it",
            ),
            trusted_peers: options::ConfigOption::new_str_no_default(
                "virtualchannels-trusted-peers",
                "Comma separated node ids to open virtual channels with on start-up",
            ),
        }
    }

    pub fn register_with_builder<S, I, O>(self, builder: Builder<S, I, O>) -> Builder<S, I, O>
    where
        O: Send + AsyncWrite + Unpin + 'static,
        S: Clone + Sync + Send + 'static,
        I: AsyncRead + Send + Unpin + 'static,
    {
        builder
            .option(self.stop_on_rejection)
            .option(self.trusted_peers)
    }

    /// Reads the options once lightningd has configured the plugin.
    pub fn extract_config<S, I, O>(
        &self,
        plugin: &ConfiguredPlugin<S, I, O>,
    ) -> Result<Config, ConfigValidationError>
    where
        O: Send + AsyncWrite + Unpin + 'static,
        S: Clone + Sync + Send + 'static,
        I: AsyncRead + Send + Unpin + 'static,
    {
        let stop_on_rejection = plugin.option(&self.stop_on_rejection).map_err(|e| {
            ConfigValidationError::PluginError {
                field: "stop_on_rejection",
                source: e,
            }
        })?;

        let mut builder = ConfigBuilder::new().stop_on_rejection(stop_on_rejection);

        if let Ok(value) = plugin.option(&self.trusted_peers) {
            builder = builder.trusted_peers(value);
        }

        builder.build()
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    stop_on_rejection: bool,
    trusted_peers: Option<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_on_rejection(mut self, value: bool) -> Self {
        self.stop_on_rejection = value;
        self
    }

    pub fn trusted_peers(mut self, value: Option<String>) -> Self {
        self.trusted_peers = value;
        self
    }

    pub fn build(self) -> Result<Config, ConfigValidationError> {
        let policy = if self.stop_on_rejection {
            FallbackPolicy::StopOnRejection
        } else {
            FallbackPolicy::AdvanceOnRejection
        };

        let trusted_peers = match self.trusted_peers.as_deref() {
            Some(s) => parse_peer_list(s)?,
            None => vec![],
        };

        Ok(Config {
            policy,
            trusted_peers,
        })
    }
}

fn parse_peer_list(s: &str) -> Result<Vec<PublicKey>, ConfigValidationError> {
    let mut peers: Vec<PublicKey> = vec![];
    for id in s.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        let peer = PublicKey::from_str(id).map_err(|e| ConfigValidationError::InvalidValue {
            field: "trusted_peers",
            reason: format!("{}: {}", id, e),
        })?;
        if !peers.contains(&peer) {
            peers.push(peer);
        }
    }
    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::tests::peer;

    #[test]
    fn test_defaults() {
        let config = ConfigBuilder::new().build().unwrap();
        assert_eq!(config.policy(), FallbackPolicy::AdvanceOnRejection);
        assert!(config.trusted_peers().is_empty());
    }

    #[test]
    fn test_stop_on_rejection() {
        let config = ConfigBuilder::new()
            .stop_on_rejection(true)
            .build()
            .unwrap();
        assert_eq!(config.policy(), FallbackPolicy::StopOnRejection);
    }

    #[test]
    fn test_trusted_peers_are_parsed_and_deduplicated() {
        let (a, b) = (peer(1), peer(2));
        let list = format!(" {a}, {b},,{a} ");
        let config = ConfigBuilder::new()
            .trusted_peers(Some(list))
            .build()
            .unwrap();
        assert_eq!(config.trusted_peers(), &[a, b]);
    }

    #[test]
    fn test_invalid_trusted_peer_is_rejected() {
        let err = ConfigBuilder::new()
            .trusted_peers(Some("02abcd".to_string()))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigValidationError::InvalidValue {
                field: "trusted_peers",
                ..
            }
        ));
    }
}
