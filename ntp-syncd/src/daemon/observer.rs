use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Instant;

use ntp_sync::{EngineSnapshot, ReferenceReport, SourceReport};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::warn;

use super::config::ObservabilityConfig;
use super::sockets::create_unix_socket_with_permissions;

#[derive(Debug, Serialize, Deserialize)]
pub struct ObservableState {
    pub program: ProgramData,
    pub reference: ReferenceReport,
    pub selected: Option<usize>,
    pub sources: Vec<ObservedSource>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProgramData {
    pub version: String,
    pub build_commit: String,
    pub build_commit_date: String,
    pub uptime_seconds: f64,
}

impl ProgramData {
    pub fn with_uptime(uptime_seconds: f64) -> ProgramData {
        ProgramData {
            uptime_seconds,
            ..Default::default()
        }
    }
}

impl Default for ProgramData {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_owned(),
            build_commit: env!("NTP_SYNCD_GIT_REV").to_owned(),
            build_commit_date: env!("NTP_SYNCD_GIT_DATE").to_owned(),
            uptime_seconds: 0.0,
        }
    }
}

/// Configured details of a source, reported next to its selection state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInfo {
    pub path: PathBuf,
    pub poll_interval: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ObservedSource {
    #[serde(flatten)]
    pub info: SourceInfo,
    #[serde(flatten)]
    pub report: SourceReport,
}

impl ObservableState {
    fn new(uptime_seconds: f64, sources: &[SourceInfo], snapshot: &EngineSnapshot) -> Self {
        ObservableState {
            program: ProgramData::with_uptime(uptime_seconds),
            reference: snapshot.reference.clone(),
            selected: snapshot.selected,
            sources: sources
                .iter()
                .zip(&snapshot.sources)
                .map(|(info, report)| ObservedSource {
                    info: info.clone(),
                    report: report.clone(),
                })
                .collect(),
        }
    }
}

pub fn spawn(
    config: &ObservabilityConfig,
    sources: Vec<SourceInfo>,
    snapshot_reader: tokio::sync::watch::Receiver<EngineSnapshot>,
) -> JoinHandle<std::io::Result<()>> {
    let config = config.clone();
    tokio::spawn(async move {
        let result = observer(config, sources, snapshot_reader).await;
        if let Err(ref e) = result {
            warn!("Abnormal termination of the state observer: {e}");
            warn!("The state observer will not be available");
        }
        result
    })
}

async fn observer(
    config: ObservabilityConfig,
    sources: Vec<SourceInfo>,
    snapshot_reader: tokio::sync::watch::Receiver<EngineSnapshot>,
) -> std::io::Result<()> {
    let start_time = Instant::now();

    let path = match config.observation_path {
        Some(path) => path,
        None => return Ok(()),
    };

    // the daemon runs as root to steer the clock, but reading its state
    // should not need elevated permissions
    let permissions: std::fs::Permissions =
        PermissionsExt::from_mode(config.observation_permissions);

    let listener = create_unix_socket_with_permissions(&path, permissions)?;

    loop {
        let (mut stream, _addr) = listener.accept().await?;

        let observe = ObservableState::new(
            start_time.elapsed().as_secs_f64(),
            &sources,
            &snapshot_reader.borrow(),
        );

        super::sockets::write_json(&mut stream, &observe).await?;
    }
}
