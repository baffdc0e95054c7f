//! Receive side of a channel endpoint.
//!
//! Each endpoint owns an inbox list in the store. The peer appends frames to
//! it and pokes the endpoint's control channel; this task drains the inbox
//! and turns frames into events. Non-reliable endpoints pop frames off the
//! inbox. Reliable endpoints walk a cursor that restarts at every connect,
//! so anything not yet acked is replayed in order.

use super::{ChannelEvent, ChannelShared, ChannelState};
use crate::error::BusError;
use crate::payload::Payload;
use crate::store::{ListItem, Store};
use anyhow::{Context, Result};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Keys of one tagged side of a channel
#[derive(Debug, Clone)]
pub(crate) struct EndpointKeys {
    pub tag: String,
    pub inbox: String,
    pub seq: String,
    pub ctl: String,
}

impl EndpointKeys {
    pub fn new(channel: &str, tag: &str) -> Self {
        let prefix = format!("fedbus:ch:{}:{}", channel, tag);
        Self {
            tag: tag.to_string(),
            inbox: format!("{}:inbox", prefix),
            seq: format!("{}:seq", prefix),
            ctl: format!("{}:ctl", prefix),
        }
    }
}

/// Hash of connected tags → endpoint id
pub(crate) fn presence_key(channel: &str) -> String {
    format!("fedbus:ch:{}:present", channel)
}

/// Frame stored in an inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "payload", rename_all = "snake_case")]
pub(crate) enum ChannelFrame {
    Message(Payload),
    End,
}

/// Notification published on an endpoint's control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Control {
    /// The peer endpoint `endpoint` is connected
    Hello { endpoint: String },
    /// A frame was appended to the inbox
    Pushed,
}

pub(crate) struct EndpointContext {
    pub store: Arc<dyn Store>,
    pub shared: Arc<ChannelShared>,
    pub own: EndpointKeys,
    pub endpoint_id: String,
    pub reliable: bool,
    pub poll_interval: Duration,
}

pub(crate) struct EndpointHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl EndpointHandle {
    pub fn spawn(context: EndpointContext, control: BoxStream<'static, Vec<u8>>) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let receiver = Receiver {
            context,
            control: Some(control),
            stop_rx,
            cursor: 0,
        };
        let join = tokio::spawn(receiver.run());
        Self { stop_tx, join }
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "Channel endpoint task failed");
        }
    }
}

enum Drained {
    Idle,
    Ended,
    Stopped,
}

enum Wake {
    Stop,
    Control(Vec<u8>),
    ControlEnded,
    Timeout,
}

struct Receiver {
    context: EndpointContext,
    control: Option<BoxStream<'static, Vec<u8>>>,
    stop_rx: watch::Receiver<bool>,
    /// Last inbox id delivered by a reliable endpoint in this connection
    cursor: u64,
}

impl Receiver {
    async fn run(mut self) {
        debug!(
            channel = %self.context.shared.name(),
            tag = %self.context.own.tag,
            reliable = self.context.reliable,
            "Channel endpoint receiving"
        );

        loop {
            match self.drain().await {
                Ok(Drained::Idle) => {}
                Ok(Drained::Ended) => {
                    self.on_end().await;
                    return;
                }
                Ok(Drained::Stopped) => return,
                Err(e) => {
                    warn!(channel = %self.context.shared.name(), error = %e, "Channel receive failed");
                    self.context
                        .shared
                        .emit(ChannelEvent::Error(BusError::channel(e)));
                }
            }

            if !self.wait().await {
                return;
            }
        }
    }

    async fn next_frame(&mut self) -> Result<Option<ListItem>> {
        let store = &*self.context.store;
        let inbox = &self.context.own.inbox;
        if !self.context.reliable {
            return store.list_pop(inbox).await;
        }
        let next = store
            .list_peek_range(inbox, self.cursor, 1)
            .await?
            .into_iter()
            .next();
        if let Some((id, _)) = &next {
            self.cursor = *id;
        }
        Ok(next)
    }

    async fn drain(&mut self) -> Result<Drained> {
        loop {
            if *self.stop_rx.borrow() {
                return Ok(Drained::Stopped);
            }
            let Some((seq, raw)) = self.next_frame().await? else {
                return Ok(Drained::Idle);
            };
            let frame: ChannelFrame =
                serde_json::from_slice(&raw).context("decoding channel frame")?;
            match frame {
                ChannelFrame::Message(payload) => {
                    self.context.shared.emit(ChannelEvent::Message {
                        payload,
                        id: self.context.reliable.then_some(seq),
                    });
                }
                ChannelFrame::End => {
                    if self.context.reliable {
                        self.context
                            .store
                            .list_remove(&self.context.own.inbox, seq)
                            .await?;
                    }
                    return Ok(Drained::Ended);
                }
            }
        }
    }

    /// Wait for a control message or the poll interval. False means stop.
    async fn wait(&mut self) -> bool {
        let poll = tokio::time::sleep(self.context.poll_interval);
        let wake = match self.control.as_mut() {
            Some(control) => tokio::select! {
                _ = self.stop_rx.changed() => Wake::Stop,
                item = control.next() => match item {
                    Some(raw) => Wake::Control(raw),
                    None => Wake::ControlEnded,
                },
                _ = poll => Wake::Timeout,
            },
            None => tokio::select! {
                _ = self.stop_rx.changed() => Wake::Stop,
                _ = poll => Wake::Timeout,
            },
        };

        match wake {
            Wake::Stop => false,
            Wake::Control(raw) => {
                match serde_json::from_slice::<Control>(&raw) {
                    Ok(Control::Hello { endpoint }) => self.context.shared.remote_connected(&endpoint),
                    Ok(Control::Pushed) => {}
                    Err(e) => {
                        warn!(channel = %self.context.shared.name(), error = %e, "Bad control message")
                    }
                }
                true
            }
            Wake::ControlEnded => {
                debug!(channel = %self.context.shared.name(), "Channel control subscription ended");
                self.control = None;
                true
            }
            Wake::Timeout => {
                if self.control.is_none() {
                    self.control = self.context.store.subscribe(&self.context.own.ctl).await.ok();
                }
                true
            }
        }
    }

    async fn on_end(&mut self) {
        let presence = presence_key(self.context.shared.name());
        if let Err(e) = self
            .context
            .store
            .hash_cas(
                &presence,
                &self.context.own.tag,
                Some(self.context.endpoint_id.as_bytes()),
                None,
            )
            .await
        {
            warn!(channel = %self.context.shared.name(), error = %e, "Failed to clear presence");
        }
        self.context.shared.set_state(ChannelState::Ended);
        info!(channel = %self.context.shared.name(), tag = %self.context.own.tag, "Channel ended by peer");
        self.context.shared.emit(ChannelEvent::End);
    }
}
