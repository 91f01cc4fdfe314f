use std::{fmt, os::unix::fs::PermissionsExt, path::PathBuf};

use ntp_sync::{NtpLeap, NtpTimestamp, Sample};
use serde::Deserialize;
use tokio::{net::UnixDatagram, sync::mpsc};
use tracing::{debug, error, instrument, warn, Instrument, Span};

use super::sockets::create_unix_datagram_with_permissions;

/// Largest datagram a measurement may be sent in.
const MAX_MESSAGE_SIZE: usize = 2048;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeapMessage {
    #[default]
    Normal,
    Insert,
    Delete,
    Unsynchronised,
}

impl From<LeapMessage> for NtpLeap {
    fn from(value: LeapMessage) -> Self {
        match value {
            LeapMessage::Normal => NtpLeap::Normal,
            LeapMessage::Insert => NtpLeap::InsertSecond,
            LeapMessage::Delete => NtpLeap::DeleteSecond,
            LeapMessage::Unsynchronised => NtpLeap::Unsynchronised,
        }
    }
}

/// One measurement of a source, as sent by the process doing the measuring.
/// A positive offset means the local clock is ahead of the source.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SampleMessage {
    pub offset: f64,
    /// Unix time of the measurement, the moment of reception when absent
    #[serde(default)]
    pub time: Option<f64>,
    #[serde(default)]
    pub delay: f64,
    #[serde(default)]
    pub dispersion: f64,
    #[serde(default)]
    pub root_delay: f64,
    #[serde(default)]
    pub root_dispersion: f64,
    #[serde(default)]
    pub stratum: u8,
    #[serde(default)]
    pub leap: LeapMessage,
}

#[derive(Debug)]
pub enum SampleError {
    Json(serde_json::Error),
    Invalid(&'static str),
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json(e) => write!(f, "could not parse sample: {e}"),
            Self::Invalid(what) => write!(f, "invalid sample: {what}"),
        }
    }
}

impl std::error::Error for SampleError {}

impl From<serde_json::Error> for SampleError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl SampleMessage {
    pub fn parse(data: &[u8]) -> Result<Self, SampleError> {
        let message: SampleMessage = serde_json::from_slice(data)?;

        if !message.offset.is_finite() {
            return Err(SampleError::Invalid("offset is not a finite number"));
        }
        if let Some(time) = message.time {
            if !time.is_finite() || time < 0.0 {
                return Err(SampleError::Invalid("time is not a valid unix time"));
            }
        }
        for value in [
            message.delay,
            message.dispersion,
            message.root_delay,
            message.root_dispersion,
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(SampleError::Invalid(
                    "delays and dispersions must be non-negative",
                ));
            }
        }

        Ok(message)
    }

    /// Turn the message into a sample, using `received` when the message
    /// carries no time of its own.
    pub fn to_sample(&self, received: NtpTimestamp) -> Sample {
        Sample {
            time: self
                .time
                .map(NtpTimestamp::from_unix_seconds)
                .unwrap_or(received),
            offset: self.offset,
            peer_delay: self.delay,
            peer_dispersion: self.dispersion,
            root_delay: self.root_delay,
            root_dispersion: self.root_dispersion,
            stratum: self.stratum,
            leap: self.leap.into(),
        }
    }
}

#[derive(Debug)]
pub enum MsgForSystem {
    Sample(usize, SampleMessage),
    /// The socket of the source failed, it will not deliver any more samples
    SourceFailed(usize),
}

pub(crate) struct SampleSourceTask {
    index: usize,
    socket: UnixDatagram,
    sender: mpsc::Sender<MsgForSystem>,
}

impl SampleSourceTask {
    async fn run(&mut self) {
        let mut buf = [0u8; MAX_MESSAGE_SIZE];
        loop {
            let size = match self.socket.recv(&mut buf).await {
                Ok(size) => size,
                Err(e) => {
                    error!(error = ?e, "Could not receive from sample socket");
                    self.sender
                        .send(MsgForSystem::SourceFailed(self.index))
                        .await
                        .ok();
                    return;
                }
            };

            let message = match SampleMessage::parse(&buf[..size]) {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed sample");
                    continue;
                }
            };

            debug!(offset = message.offset, "received sample");
            if self
                .sender
                .send(MsgForSystem::Sample(self.index, message))
                .await
                .is_err()
            {
                // the system is gone, nobody to deliver to
                return;
            }
        }
    }

    #[instrument(level = tracing::Level::ERROR, name = "Sample Source", skip(sender))]
    pub fn spawn(
        index: usize,
        path: PathBuf,
        permissions: u32,
        sender: mpsc::Sender<MsgForSystem>,
    ) -> std::io::Result<tokio::task::JoinHandle<()>> {
        let socket =
            create_unix_datagram_with_permissions(&path, PermissionsExt::from_mode(permissions))?;

        Ok(tokio::spawn(
            (async move {
                let mut process = SampleSourceTask {
                    index,
                    socket,
                    sender,
                };

                process.run().await;
            })
            .instrument(Span::current()),
        ))
    }
}
