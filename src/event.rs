//! Control events delivered to the state machine.
//!
//! Background tasks never touch device state directly. They send a
//! [`ControlEvent`] into a single mpsc channel that the control loop drains at
//! the start of every tick.

use anyhow::{Context, Result};
use tokio::sync::mpsc::{self, error::TryRecvError};

use crate::device_config::DeviceConfig;

const DEFAULT_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// The setup UI finished with a new configuration.
    ConfigSubmitted(DeviceConfig),
    /// The setup UI was dismissed without a configuration.
    PortalAborted,
    /// The persisted device configuration changed on disk.
    ConfigChanged,
    /// Manual reset out of the error state.
    Reset,
}

/// Sending half, cloned into every producer.
#[derive(Debug, Clone)]
pub struct ControlSender {
    sender: mpsc::Sender<ControlEvent>,
}

impl ControlSender {
    pub async fn send(&self, event: ControlEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .context("Control loop is no longer receiving events")
    }

    /// Non-blocking send for callers outside an async context.
    pub fn try_send(&self, event: ControlEvent) -> Result<()> {
        self.sender
            .try_send(event)
            .context("Control channel is full or closed")
    }
}

/// Receiving half, owned by the control loop.
#[derive(Debug)]
pub struct ControlReceiver {
    receiver: mpsc::Receiver<ControlEvent>,
}

impl ControlReceiver {
    /// Takes every event queued so far without waiting.
    pub fn drain(&mut self) -> Vec<ControlEvent> {
        let mut events = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        events
    }

    pub async fn recv(&mut self) -> Option<ControlEvent> {
        self.receiver.recv().await
    }
}

pub fn control_channel() -> (ControlSender, ControlReceiver) {
    control_channel_with_capacity(DEFAULT_CAPACITY)
}

pub fn control_channel_with_capacity(capacity: usize) -> (ControlSender, ControlReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (ControlSender { sender }, ControlReceiver { receiver })
}
