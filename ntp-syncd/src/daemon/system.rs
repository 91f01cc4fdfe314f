use std::{pin::Pin, time::Duration};

use clock_steering::unix::UnixClock;
use ntp_sync::{
    ClockChange, ClockChangeKind, EngineSnapshot, LeapDatabase, LeapSecondsList, LocalClock,
    NtpTimestamp, ReferenceMode, ReferenceSteerer, ReferenceUpdateResult, Source, SourceKind,
    SourceSelector, SyncEngine,
};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::{mpsc, watch},
    time::{Instant, Sleep},
};
use tracing::{debug, error, info, warn};

use super::{
    clock::SystemClockDriver,
    config::Config,
    exitcode,
    observer::{self, SourceInfo},
    sample_source::{MsgForSystem, SampleSourceTask},
    stats::SourceStats,
};

/// Longest the loop sleeps without anything to do.
const MAX_SLEEP: Duration = Duration::from_secs(3600);

struct SourceState {
    poll_interval: Duration,
    next_poll: Instant,
    /// A sample arrived during the current poll interval
    reached: bool,
}

/// What the loop should do after handling an event.
enum Flow {
    Continue,
    Exit(i32),
}

pub(crate) struct System {
    engine: SyncEngine<SystemClockDriver, SourceStats>,
    sources: Vec<SourceState>,
    /// Mode the reference was started in
    mode: ReferenceMode,
    msg_for_system_rx: mpsc::Receiver<MsgForSystem>,
    snapshot_sender: watch::Sender<EngineSnapshot>,
}

fn open_leap_database(config: &Config) -> Option<Box<dyn LeapDatabase>> {
    let path = config.leap_seconds_file.as_ref()?;
    match LeapSecondsList::from_file(path) {
        Ok(list) => {
            info!(?path, "Loaded leap seconds list");
            Some(Box::new(list))
        }
        Err(e) => {
            warn!(?path, error = %e, "Could not load leap seconds list");
            None
        }
    }
}

fn initial_mode(config: &Config, mode: Option<ReferenceMode>) -> ReferenceMode {
    match mode {
        Some(mode) => mode,
        None if config.reference.init_step_threshold.is_some() => ReferenceMode::InitStepSlew,
        None => ReferenceMode::Normal,
    }
}

/// Set up the engine and the sample sources, then run until shutdown or the
/// end of a one-shot mode. Returns the exit code of the daemon.
pub(crate) async fn run(config: Config, mode: Option<ReferenceMode>) -> std::io::Result<i32> {
    let driver = match SystemClockDriver::new(UnixClock::CLOCK_REALTIME) {
        Ok(driver) => driver,
        Err(e) => {
            error!(error = ?e, "Could not take control of the system clock");
            return Ok(exitcode::NOPERM);
        }
    };

    let clock = LocalClock::new(driver, &config.clock);
    let steerer = ReferenceSteerer::new(clock, config.reference.clone(), open_leap_database(&config));
    let mut engine = SyncEngine::new(SourceSelector::new(config.synchronization), steerer);

    let mode = initial_mode(&config, mode);
    debug!(?mode, "Starting reference");
    engine.set_mode(mode);

    engine.add_listener(Box::new(|change: &ClockChange| match change.kind {
        ClockChangeKind::Step => info!(offset = change.doffset, "Clock was stepped"),
        ClockChangeKind::UnknownStep => warn!("Clock was stepped by another process"),
        ClockChangeKind::Adjust => {}
    }));

    let (msg_for_system_tx, msg_for_system_rx) = mpsc::channel(32);
    let mut sources = Vec::with_capacity(config.sources.len());
    let mut infos = Vec::with_capacity(config.sources.len());

    for source_config in &config.sources {
        let kind = if source_config.address.is_some() {
            SourceKind::Ntp
        } else {
            SourceKind::RefClock
        };
        let index = engine.add_source(Source::new(
            source_config.reference_id(),
            source_config.address,
            kind,
            source_config.select_options(),
            SourceStats::new(),
        ));

        SampleSourceTask::spawn(
            index,
            source_config.path.clone(),
            source_config.permissions,
            msg_for_system_tx.clone(),
        )?;

        let poll_interval = Duration::from_secs_f64(source_config.poll_interval);
        sources.push(SourceState {
            poll_interval,
            next_poll: Instant::now() + poll_interval,
            reached: false,
        });
        infos.push(SourceInfo {
            path: source_config.path.clone(),
            poll_interval: source_config.poll_interval,
        });
    }
    drop(msg_for_system_tx);

    let (snapshot_sender, snapshot_receiver) = watch::channel(engine.snapshot());
    observer::spawn(&config.observability, infos, snapshot_receiver);

    let mut system = System {
        engine,
        sources,
        mode,
        msg_for_system_rx,
        snapshot_sender,
    };

    let wait = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(wait);

    let code = system.run(wait).await;
    system.engine.finalise();
    code
}

impl System {
    async fn run(&mut self, mut wait: Pin<&mut Sleep>) -> std::io::Result<i32> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sources_open = true;

        loop {
            wait.as_mut().reset(self.next_wakeup());

            let flow = tokio::select! {
                opt_msg_for_system = self.msg_for_system_rx.recv(), if sources_open => {
                    match opt_msg_for_system {
                        None => {
                            // every sample source has stopped
                            sources_open = false;
                            Flow::Continue
                        }
                        Some(msg_for_system) => self.handle_source_message(msg_for_system),
                    }
                }
                () = &mut wait => self.handle_timers(),
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, shutting down");
                    Flow::Exit(0)
                }
                _ = sigterm.recv() => {
                    info!("Terminated, shutting down");
                    Flow::Exit(0)
                }
            };

            // Don't care if there is no receiver.
            self.snapshot_sender.send_replace(self.engine.snapshot());

            if let Flow::Exit(code) = flow {
                return Ok(code);
            }
        }
    }

    fn now(&self) -> NtpTimestamp {
        self.engine.steerer().clock().read_raw_time()
    }

    /// Earliest of the engine deadline and the next source poll.
    fn next_wakeup(&self) -> Instant {
        let now = Instant::now();
        let mut wakeup = now + MAX_SLEEP;

        if let Some(deadline) = self.engine.next_deadline() {
            let wait = deadline.seconds_since(self.now()).clamp(0.0, MAX_SLEEP.as_secs_f64());
            wakeup = wakeup.min(now + Duration::from_secs_f64(wait));
        }

        self.sources
            .iter()
            .map(|source| source.next_poll)
            .fold(wakeup, Instant::min)
    }

    fn handle_source_message(&mut self, msg: MsgForSystem) -> Flow {
        match msg {
            MsgForSystem::Sample(index, message) => {
                if !self.sources[index].reached {
                    self.sources[index].reached = true;
                    let result = self.engine.update_reachability(index, true);
                    if let Flow::Exit(code) = self.handle_result(result) {
                        return Flow::Exit(code);
                    }
                }

                let sample = message.to_sample(self.now());
                let result = self.engine.accumulate_sample(index, &sample);
                self.handle_result(result)
            }
            MsgForSystem::SourceFailed(index) => {
                warn!(index, "Sample source stopped, it will become unreachable");
                Flow::Continue
            }
        }
    }

    fn handle_timers(&mut self) -> Flow {
        let now = Instant::now();

        for index in 0..self.sources.len() {
            if self.sources[index].next_poll > now {
                continue;
            }

            let source = &mut self.sources[index];
            source.next_poll += source.poll_interval;
            if source.next_poll <= now {
                // we fell behind, don't try to catch up
                source.next_poll = now + source.poll_interval;
            }
            let reached = std::mem::take(&mut source.reached);

            if !reached {
                let result = self.engine.update_reachability(index, false);
                if let Flow::Exit(code) = self.handle_result(result) {
                    return Flow::Exit(code);
                }
            }
        }

        let result = self.engine.handle_timeout(self.now());
        self.handle_result(result)
    }

    fn handle_result(&mut self, result: ReferenceUpdateResult) -> Flow {
        let ReferenceUpdateResult::ModeEnd { success } = result else {
            return Flow::Continue;
        };

        if self.mode == ReferenceMode::InitStepSlew {
            if success {
                info!("Initial correction done, continuing normal operation");
            } else {
                warn!("Initial correction of the clock failed, continuing normal operation");
            }
            self.mode = ReferenceMode::Normal;
            self.engine.set_mode(ReferenceMode::Normal);
            return Flow::Continue;
        }

        Flow::Exit(if success { 0 } else { exitcode::SOFTWARE })
    }
}
