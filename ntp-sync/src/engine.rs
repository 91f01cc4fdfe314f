use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    clock::{ClockChange, ClockChangeKind, ClockDriver, ClockEvent},
    reference::{ReferenceMode, ReferenceParams, ReferenceReport, ReferenceSteerer, ReferenceUpdateResult},
    scheduler::TimerQueue,
    selection::{SelectionContext, SelectionOutcome, SourceSelector},
    source::{Sample, Source, SourceReport, SourceStatistics},
    NtpTimestamp, ReferenceId,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Called for every change of the local clock, after the selector and the
/// reference have seen it.
pub type ClockChangeListener = Box<dyn FnMut(&ClockChange)>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub reference: ReferenceReport,
    pub selected: Option<usize>,
    pub sources: Vec<SourceReport>,
}

/// Keep the most important of two results: the end of a mode, then any
/// actual change of the clock.
fn merge_results(a: ReferenceUpdateResult, b: ReferenceUpdateResult) -> ReferenceUpdateResult {
    match (a, b) {
        (ReferenceUpdateResult::ModeEnd { .. }, _) => a,
        (_, ReferenceUpdateResult::Ignore) => a,
        _ => b,
    }
}

/// Everything needed to turn source samples into clock adjustments. All
/// events from the outside world enter through this type.
pub struct SyncEngine<C: ClockDriver, S: SourceStatistics> {
    selector: SourceSelector<S>,
    steerer: ReferenceSteerer<C>,
    timers: TimerQueue,
    listeners: Vec<(ListenerId, ClockChangeListener)>,
    next_listener_id: u64,
    local_ref_id: Option<ReferenceId>,
    in_round: bool,
    pending_reselect: bool,
}

impl<C: ClockDriver, S: SourceStatistics> SyncEngine<C, S> {
    pub fn new(selector: SourceSelector<S>, steerer: ReferenceSteerer<C>) -> Self {
        SyncEngine {
            selector,
            steerer,
            timers: TimerQueue::new(),
            listeners: vec![],
            next_listener_id: 0,
            local_ref_id: None,
            in_round: false,
            pending_reselect: false,
        }
    }

    pub fn selector(&self) -> &SourceSelector<S> {
        &self.selector
    }

    pub fn steerer(&self) -> &ReferenceSteerer<C> {
        &self.steerer
    }

    pub fn steerer_mut(&mut self) -> &mut ReferenceSteerer<C> {
        &mut self.steerer
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    /// Reference id we identify ourselves with towards orphan peers.
    pub fn set_local_ref_id(&mut self, ref_id: Option<ReferenceId>) {
        self.local_ref_id = ref_id;
    }

    pub fn set_mode(&mut self, mode: ReferenceMode) {
        self.steerer.set_mode(mode);
    }

    pub fn add_source(&mut self, source: Source<S>) -> usize {
        self.selector.add_source(source)
    }

    /// Remove a source. Indices of later sources shift down by one.
    pub fn remove_source(&mut self, index: usize) -> ReferenceUpdateResult {
        if !self.selector.remove_source(index) {
            return ReferenceUpdateResult::Ignore;
        }

        let result = self.run_round(None);
        if self.selector.selected().is_some() {
            return result;
        }

        // the reference went away with the source
        let unsynchronised = self.steerer.set_unsynchronised(&mut self.timers);
        self.drain_clock_events();
        merge_results(result, unsynchronised)
    }

    /// A new sample for a source, which starts a selection round.
    #[instrument(level = "debug", skip(self, sample))]
    pub fn accumulate_sample(&mut self, index: usize, sample: &Sample) -> ReferenceUpdateResult {
        self.selector.accumulate_sample(index, sample);
        self.run_round(Some(index))
    }

    pub fn update_reachability(&mut self, index: usize, reachable: bool) -> ReferenceUpdateResult {
        let result = if self.selector.update_reachability(index, reachable) {
            self.run_round(None)
        } else {
            ReferenceUpdateResult::Ignore
        };

        // A one-shot mode fails once no source can become selectable
        if self.steerer.mode() == ReferenceMode::Normal || !self.selector.samples_exhausted() {
            return result;
        }
        match self.steerer.abort_special_mode() {
            Some(end) => {
                self.drain_clock_events();
                merge_results(result, end)
            }
            None => result,
        }
    }

    pub fn reset_reachability(&mut self, index: usize) -> ReferenceUpdateResult {
        if self.selector.reset_reachability(index) {
            self.run_round(None)
        } else {
            ReferenceUpdateResult::Ignore
        }
    }

    /// Forget the current selection and select from scratch.
    pub fn reselect(&mut self) -> ReferenceUpdateResult {
        self.selector.clear_selection();
        self.run_round(None)
    }

    pub fn set_reselect_distance(&mut self, distance: f64) {
        self.selector.set_reselect_distance(distance);
    }

    /// Earliest moment [`SyncEngine::handle_timeout`] has work to do.
    pub fn next_deadline(&self) -> Option<NtpTimestamp> {
        let timer = self.timers.next_deadline();
        let maintenance = self.steerer.clock().driver().maintenance_deadline();
        match (timer, maintenance) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run all timers that are due.
    pub fn handle_timeout(&mut self, now: NtpTimestamp) -> ReferenceUpdateResult {
        let mut result = ReferenceUpdateResult::Ignore;

        if self
            .steerer
            .clock()
            .driver()
            .maintenance_deadline()
            .map_or(false, |deadline| deadline <= now)
        {
            self.steerer.clock().driver().maintain();
        }

        while let Some((_, event)) = self.timers.pop_due(now) {
            debug!(?event, "Timer due");
            let step = self.steerer.handle_timeout(event, &mut self.timers);
            result = merge_results(result, step);
            self.drain_clock_events();
        }

        merge_results(result, self.run_pending())
    }

    /// The clock was stepped by someone else. All samples are useless now.
    pub fn notify_external_step(
        &mut self,
        raw: NtpTimestamp,
        cooked: NtpTimestamp,
        offset: f64,
        dispersion: f64,
    ) -> ReferenceUpdateResult {
        self.steerer
            .clock_mut()
            .notify_external_time_step(raw, cooked, offset, dispersion);
        self.drain_clock_events();
        self.run_pending()
    }

    pub fn add_listener(&mut self, listener: ClockChangeListener) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub fn reference_params(&mut self, now: NtpTimestamp) -> ReferenceParams {
        self.steerer.reference_params(now)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            reference: self.steerer.report(),
            selected: self.selector.selected(),
            sources: self.selector.reports(),
        }
    }

    pub fn finalise(&mut self) {
        self.steerer.finalise(&mut self.timers);
        self.drain_clock_events();
    }

    fn run_round(&mut self, updated: Option<usize>) -> ReferenceUpdateResult {
        if self.in_round {
            self.pending_reselect = true;
            return ReferenceUpdateResult::Ignore;
        }

        self.in_round = true;
        let result = self.select_once(updated);
        self.drain_clock_events();
        self.in_round = false;

        merge_results(result, self.run_pending())
    }

    fn run_pending(&mut self) -> ReferenceUpdateResult {
        let mut result = ReferenceUpdateResult::Ignore;
        while std::mem::take(&mut self.pending_reselect) {
            self.in_round = true;
            result = merge_results(result, self.select_once(None));
            self.drain_clock_events();
            self.in_round = false;
        }
        result
    }

    fn select_once(&mut self, updated: Option<usize>) -> ReferenceUpdateResult {
        let clock = self.steerer.clock();
        let ctx = SelectionContext {
            now: clock.read_cooked_time().0,
            updated,
            max_clock_error: clock.max_clock_error(),
            orphan_stratum: self.steerer.orphan_stratum(),
            local_ref_id: self.local_ref_id,
        };

        match self.selector.select(&ctx) {
            SelectionOutcome::Update(update) => self.steerer.set_reference(&update, &mut self.timers),
            SelectionOutcome::Unsynchronised => self.steerer.set_unsynchronised(&mut self.timers),
            SelectionOutcome::NoChange => ReferenceUpdateResult::Ignore,
        }
    }

    fn drain_clock_events(&mut self) {
        while let Some(event) = self.steerer.clock_mut().pop_event() {
            match event {
                ClockEvent::Change(change) => {
                    self.selector.handle_clock_change(&change);
                    self.steerer.handle_clock_change(&change, &mut self.timers);
                    for (_, listener) in &mut self.listeners {
                        listener(&change);
                    }

                    // nothing is selectable after the samples were dropped
                    if change.kind == ClockChangeKind::UnknownStep {
                        self.pending_reselect = true;
                    }
                }
                ClockEvent::Dispersion(dispersion) => self.selector.add_dispersion(dispersion),
            }
        }
    }
}
