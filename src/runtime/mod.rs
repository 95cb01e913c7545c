use crate::types::DeviceEvent;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod script;
pub use script::{ScriptSource, StdinSource};

#[async_trait]
pub trait DeviceSource {
    /// Start delivering device notifications.
    /// Events should be sent to the provided channel.
    async fn monitor(&mut self, event_tx: mpsc::Sender<DeviceEvent>) -> Result<()>;
}
