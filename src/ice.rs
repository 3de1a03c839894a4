use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Network-traversal server descriptor handed to clients so they can
/// configure their peer transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Traversal credential provider backed by static configuration.
///
/// The descriptor list is assembled once at startup and served verbatim;
/// credential minting is someone else's job.
#[derive(Debug, Clone)]
pub struct IceProvider {
    servers: Vec<IceServer>,
}

impl IceProvider {
    pub fn from_config(config: &Config) -> Self {
        let mut servers = vec![IceServer {
            urls: vec![config.stun_server.clone()],
            username: None,
            credential: None,
        }];

        if let Some(turn_server) = &config.turn_server {
            servers.push(IceServer {
                urls: vec![turn_server.clone()],
                username: config.turn_username.clone(),
                credential: config.turn_credential.clone(),
            });
        }

        Self { servers }
    }

    pub fn servers(&self) -> Vec<IceServer> {
        self.servers.clone()
    }
}
