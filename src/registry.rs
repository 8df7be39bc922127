//! Contains the client registry, which holds static metadata about the
//! supported execution-layer client families.

use color_eyre::eyre::bail;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt::Display, str::FromStr};

/// The client registry.
pub(crate) static CLIENT_REGISTRY: Lazy<ClientRegistry> = Lazy::new(|| {
    const REGISTRY_SER: &str = include_str!("../registry.toml");
    toml::from_str(REGISTRY_SER).expect("Failed to parse registry")
});

/// The client registry holds metadata about the supported client families.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ClientRegistry {
    /// The supported client families.
    pub(crate) client: HashMap<ClientFamily, ClientDefinition>,
}

impl ClientRegistry {
    /// Returns the definition for a client family.
    pub(crate) fn get(&self, family: ClientFamily) -> &ClientDefinition {
        self.client
            .get(&family)
            .expect("registry covers every client family")
    }
}

/// Static metadata for one client family.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct ClientDefinition {
    /// The Engine-API port the client listens on inside the container.
    pub(crate) engine_port: u16,
    /// The head-reset RPC method, if the client supports one.
    pub(crate) reset_method: Option<String>,
    /// The parameter style of the head-reset RPC.
    pub(crate) reset_param_style: Option<ResetParamStyle>,
}

/// Supported execution-layer client families.
#[derive(Default, Debug, Clone, Copy, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum ClientFamily {
    /// go-ethereum
    #[default]
    Geth,
    /// Nethermind
    Nethermind,
    /// Besu
    Besu,
    /// Erigon
    Erigon,
    /// Reth
    Reth,
    /// Nimbus EL
    Nimbus,
}

impl FromStr for ClientFamily {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "geth" => Ok(Self::Geth),
            "nethermind" => Ok(Self::Nethermind),
            "besu" => Ok(Self::Besu),
            "erigon" => Ok(Self::Erigon),
            "reth" => Ok(Self::Reth),
            "nimbus" => Ok(Self::Nimbus),
            _ => bail!("Unknown client family: {}", s),
        }
    }
}

impl Display for ClientFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Geth => write!(f, "geth"),
            Self::Nethermind => write!(f, "nethermind"),
            Self::Besu => write!(f, "besu"),
            Self::Erigon => write!(f, "erigon"),
            Self::Reth => write!(f, "reth"),
            Self::Nimbus => write!(f, "nimbus"),
        }
    }
}

/// How the head-reset RPC expects its block parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum ResetParamStyle {
    /// A quoted 0x-prefixed hex block number.
    HexNumber,
    /// A raw decimal JSON integer.
    DecimalNumber,
    /// A quoted 0x-prefixed block hash.
    BlockHash,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_round_trip_client_registry() {
        let ser = toml::to_string(&*CLIENT_REGISTRY).unwrap();
        let de: ClientRegistry = toml::from_str(&ser).unwrap();
        assert_eq!(*CLIENT_REGISTRY, de);
    }

    #[test]
    fn registry_covers_every_family() {
        for family in [
            ClientFamily::Geth,
            ClientFamily::Nethermind,
            ClientFamily::Besu,
            ClientFamily::Erigon,
            ClientFamily::Reth,
            ClientFamily::Nimbus,
        ] {
            assert_eq!(CLIENT_REGISTRY.get(family).engine_port, 8551);
        }
    }

    #[test]
    fn geth_resets_via_hex_number() {
        let def = CLIENT_REGISTRY.get(ClientFamily::Geth);
        assert_eq!(def.reset_method.as_deref(), Some("debug_setHead"));
        assert_eq!(def.reset_param_style, Some(ResetParamStyle::HexNumber));
    }
}
