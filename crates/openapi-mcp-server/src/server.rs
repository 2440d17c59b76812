//! The gateway server: built once from the runtime configuration, then
//! driven through a small starting -> running state machine.

use bon::bon;

use crate::errors::GatewayError;
use crate::runtime::Config;
use crate::tools::{DefaultToolNamer, ToolNamer};

mod states;

use states::StateMachine;

/// An OpenAPI-backed MCP gateway server.
pub struct Server {
    config: Config,
    namer: Box<dyn ToolNamer>,
}

#[bon]
impl Server {
    #[builder]
    pub fn new(config: Config, namer: Option<Box<dyn ToolNamer>>) -> Self {
        Self {
            config,
            namer: namer.unwrap_or_else(|| Box::new(DefaultToolNamer::default())),
        }
    }

    /// Run until shutdown. All initialization failures are fatal and happen
    /// before the transport accepts any client.
    pub async fn start(self) -> Result<(), GatewayError> {
        StateMachine {}.start(self).await
    }
}
