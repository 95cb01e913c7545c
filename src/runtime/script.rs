use super::DeviceSource;
use crate::types::{ChannelHandle, DeviceEvent, DeviceId, Endpoint, HostAddr, PortNo};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::mpsc;

/// One line of a device-event script.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum ScriptEvent {
    ConnectionUp {
        device: DeviceId,
    },
    ConnectionDown {
        device: DeviceId,
    },
    PacketIn {
        device: DeviceId,
        src: HostAddr,
        #[serde(default = "broadcast_addr")]
        dst: HostAddr,
        in_port: PortNo,
    },
    LinkEvent {
        added: bool,
        a: Endpoint,
        b: Endpoint,
    },
}

fn broadcast_addr() -> HostAddr {
    HostAddr([0xff; 6])
}

/// Feeds device events read as newline-delimited JSON, e.g.
/// `{"event":"packet_in","device":1,"src":"00:00:00:00:00:01","in_port":3}`.
/// Every connected device shares one control channel.
pub struct ScriptSource<R> {
    reader: R,
    channel: ChannelHandle,
}

pub type StdinSource = ScriptSource<BufReader<Stdin>>;

impl StdinSource {
    pub fn stdin(channel: ChannelHandle) -> Self {
        ScriptSource::new(BufReader::new(tokio::io::stdin()), channel)
    }
}

impl<R> ScriptSource<R> {
    pub fn new(reader: R, channel: ChannelHandle) -> Self {
        Self { reader, channel }
    }

    fn parse(&self, line: &str) -> Result<DeviceEvent> {
        let event = match serde_json::from_str::<ScriptEvent>(line)? {
            ScriptEvent::ConnectionUp { device } => DeviceEvent::ConnectionUp {
                device,
                channel: self.channel.clone(),
            },
            ScriptEvent::ConnectionDown { device } => DeviceEvent::ConnectionDown { device },
            ScriptEvent::PacketIn {
                device,
                src,
                dst,
                in_port,
            } => DeviceEvent::PacketIn {
                device,
                src,
                dst,
                in_port,
            },
            ScriptEvent::LinkEvent { added, a, b } => DeviceEvent::LinkEvent { added, a, b },
        };
        Ok(event)
    }
}

#[async_trait]
impl<R> DeviceSource for ScriptSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn monitor(&mut self, event_tx: mpsc::Sender<DeviceEvent>) -> Result<()> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                info!("Device script ended");
                return Ok(());
            }
            let text = line.trim();
            if text.is_empty() || text.starts_with('#') {
                continue;
            }
            match self.parse(text) {
                Ok(event) => {
                    debug!("Device event: {:?}", event);
                    event_tx
                        .send(event)
                        .await
                        .map_err(|_| anyhow!("Channel closed"))?;
                }
                Err(e) => warn!("Skipping bad device event {:?}: {}", text, e),
            }
        }
    }
}
