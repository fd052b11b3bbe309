//! Machine bootstrap: join tokens and startup scripts

mod script;
mod token;

pub use script::{api_endpoint, ScriptRenderer};
#[cfg(test)]
pub use token::MockBootstrapTokenService;
pub use token::{BootstrapTokenService, JoinToken, KubeadmTokenService, NODE_BOOTSTRAP_GROUP};
