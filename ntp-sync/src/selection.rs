use std::{cmp::Ordering, net::IpAddr};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    clock::{ClockChange, ClockChangeKind},
    config::SelectionConfig,
    regression::MIN_SAMPLES_FOR_REGRESS,
    source::{
        Sample, Source, SourceKind, SourceReport, SourceStatistics, SourceStatus, TrackingData,
        REACH_BITS,
    },
    NtpLeap, NtpTimestamp, ReferenceId,
};

/// Number of rounds a source stays excluded from combining after it was
/// found too far from the selected source.
pub const DISTANT_PENALTY: u32 = 32;

/// Score a source needs to reach before it replaces the selected source.
pub const SCORE_LIMIT: f64 = 10.0;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum EndpointTag {
    Low,
    High,
}

/// One end of the confidence interval of a source.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Endpoint {
    pub index: usize,
    pub offset: f64,
    pub tag: EndpointTag,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct BestInterval {
    /// Number of source intervals containing the interval
    pub depth: usize,
    pub lo: f64,
    pub hi: f64,
}

/// Find the interval contained in the largest number of source intervals.
/// The endpoints are sorted in place by offset, low ends first on ties. When
/// multiple disjoint intervals reach the same depth the first one wins.
pub fn find_best_interval(endpoints: &mut [Endpoint]) -> BestInterval {
    endpoints.sort_by(|a, b| {
        a.offset
            .partial_cmp(&b.offset)
            .unwrap_or(Ordering::Equal)
            .then(a.tag.cmp(&b.tag))
    });

    let mut depth = 0usize;
    let mut best = BestInterval {
        depth: 0,
        lo: 0.0,
        hi: 0.0,
    };
    let mut in_best = false;

    for endpoint in endpoints.iter() {
        match endpoint.tag {
            EndpointTag::Low => {
                depth += 1;
                if depth > best.depth {
                    best.depth = depth;
                    best.lo = endpoint.offset;
                    in_best = true;
                }
            }
            EndpointTag::High => {
                if in_best {
                    best.hi = endpoint.offset;
                    in_best = false;
                }
                depth = depth
                    .checked_sub(1)
                    .expect("interval closed before it was opened");
            }
        }
    }

    assert_eq!(depth, 0, "unbalanced interval endpoints");

    best
}

/// Everything the reference needs to know about the result of a selection.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceUpdate {
    /// Stratum of the selected source
    pub stratum: u8,
    pub leap: NtpLeap,
    pub combined_sources: usize,
    pub ref_id: ReferenceId,
    pub ip: Option<IpAddr>,
    pub ref_time: NtpTimestamp,
    pub offset: f64,
    pub offset_sd: f64,
    pub frequency: f64,
    pub skew: f64,
    pub root_delay: f64,
    pub root_dispersion: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectionOutcome {
    /// A source is selected and has new data for the reference
    Update(ReferenceUpdate),
    /// We can no longer synchronise to anything
    Unsynchronised,
    NoChange,
}

/// Inputs of a selection round owned by other parts of the daemon.
#[derive(Debug, Copy, Clone)]
pub struct SelectionContext {
    pub now: NtpTimestamp,
    /// Source that triggered the round with a new sample
    pub updated: Option<usize>,
    /// Maximum error of the local clock frequency
    pub max_clock_error: f64,
    /// Our stratum when serving orphan time
    pub orphan_stratum: Option<u8>,
    /// Reference id we use towards other orphans
    pub local_ref_id: Option<ReferenceId>,
}

#[derive(Debug)]
pub struct SourceSelector<S> {
    config: SelectionConfig,
    sources: Vec<Source<S>>,
    selected: Option<usize>,
    sel_sources: Vec<usize>,
    endpoints: Vec<Endpoint>,
}

impl<S: SourceStatistics> SourceSelector<S> {
    pub fn new(config: SelectionConfig) -> Self {
        SourceSelector {
            config,
            sources: vec![],
            selected: None,
            sel_sources: vec![],
            endpoints: vec![],
        }
    }

    pub fn add_source(&mut self, source: Source<S>) -> usize {
        debug!(ref_id = %source.ref_id, "Adding source");
        self.sources.push(source);
        self.sources.len() - 1
    }

    /// Remove a source, shifting the indices of later sources down by one.
    /// Returns whether the removed source was the selected one.
    pub fn remove_source(&mut self, index: usize) -> bool {
        assert!(index < self.sources.len(), "removing unknown source");

        let source = self.sources.remove(index);
        debug!(ref_id = %source.ref_id, "Removed source");

        match self.selected {
            Some(selected) if selected == index => {
                self.selected = None;
                true
            }
            Some(selected) if selected > index => {
                self.selected = Some(selected - 1);
                false
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn source(&self, index: usize) -> &Source<S> {
        &self.sources[index]
    }

    pub fn source_mut(&mut self, index: usize) -> &mut Source<S> {
        &mut self.sources[index]
    }

    pub fn sources(&self) -> &[Source<S>] {
        &self.sources
    }

    pub fn selected(&self) -> Option<usize> {
        self.selected
    }

    pub fn reselect_distance(&self) -> f64 {
        self.config.reselect_distance
    }

    pub fn set_reselect_distance(&mut self, distance: f64) {
        if self.config.reselect_distance != distance {
            self.config.reselect_distance = distance;
            info!(distance, "New reselect distance");
        }
    }

    /// Forget the selected source, so the next round starts from scratch.
    pub fn clear_selection(&mut self) {
        self.selected = None;
    }

    pub fn accumulate_sample(&mut self, index: usize, sample: &Sample) {
        let source = &mut self.sources[index];
        source.leap = sample.leap;
        source.updates += 1;
        source.stats.accumulate_sample(sample);
    }

    /// Record the outcome of a poll. Returns whether this lost the selected
    /// source, which calls for a new selection round.
    pub fn update_reachability(&mut self, index: usize, reachable: bool) -> bool {
        self.sources[index].reach.update(reachable);
        !reachable && self.selected == Some(index)
    }

    /// True when no source can collect enough samples to become selectable
    /// before its reachability register fills up.
    pub fn samples_exhausted(&self) -> bool {
        self.sources.iter().all(|source| {
            let size = source.reach.size();
            size >= REACH_BITS - 1
                || usize::from(REACH_BITS - 1 - size) + source.stats.sample_count()
                    < MIN_SAMPLES_FOR_REGRESS
        })
    }

    pub fn reset_reachability(&mut self, index: usize) -> bool {
        self.sources[index].reach.reset();
        self.update_reachability(index, false)
    }

    /// Adjust the samples of all sources for a change of the local clock.
    /// Unknown steps make all samples useless.
    pub fn handle_clock_change(&mut self, change: &ClockChange) {
        for source in &mut self.sources {
            match change.kind {
                ClockChangeKind::UnknownStep => source.stats.reset(),
                ClockChangeKind::Adjust | ClockChangeKind::Step => {
                    source
                        .stats
                        .slew_samples(change.cooked, change.dfreq, change.doffset)
                }
            }
        }
    }

    pub fn add_dispersion(&mut self, dispersion: f64) {
        for source in &mut self.sources {
            source.stats.add_dispersion(dispersion);
        }
    }

    pub fn report(&self, index: usize) -> SourceReport {
        self.sources[index].report()
    }

    pub fn reports(&self) -> Vec<SourceReport> {
        self.sources.iter().map(Source::report).collect()
    }

    fn mark_ok_sources(&mut self, status: SourceStatus) {
        for source in self.sources.iter_mut().filter(|source| source.ok) {
            source.mark(status);
        }
    }

    /// Drop the selected source. Only losing a selected source makes us
    /// unsynchronised.
    fn give_up(&mut self, reason: &str) -> SelectionOutcome {
        match self.selected.take() {
            Some(_) => {
                warn!("Can't synchronise: {}", reason);
                SelectionOutcome::Unsynchronised
            }
            None => SelectionOutcome::NoChange,
        }
    }

    /// Run a selection round over all sources.
    #[instrument(level = "debug", skip(self))]
    pub fn select(&mut self, ctx: &SelectionContext) -> SelectionOutcome {
        if self.sources.is_empty() {
            return self.give_up("no sources");
        }

        let mut n_badstats_sources = 0;
        let mut max_badstat_reach = 0u8;
        let mut max_sel_reach = 0u8;
        let mut max_sel_reach_size = 0u8;
        let mut max_reach_sample_ago = 0.0f64;

        for source in &mut self.sources {
            source.ok = false;

            if source.options.noselect {
                source.mark(SourceStatus::Unselectable);
                continue;
            }

            let si = source.stats.selection_data(ctx.now);
            source.sel_info = si;

            if !si.select_ok {
                n_badstats_sources += 1;
                max_badstat_reach = max_badstat_reach.max(source.reach.register());
                source.mark(SourceStatus::BadStats);
                continue;
            }

            if !si.lo_limit.is_finite() || !si.hi_limit.is_finite() || si.hi_limit < si.lo_limit
            {
                source.mark(SourceStatus::BadStats);
                continue;
            }

            source.ok = true;

            if source.reach.is_reachable() && max_reach_sample_ago < si.first_sample_ago {
                max_reach_sample_ago = si.first_sample_ago;
            }
            max_sel_reach = max_sel_reach.max(source.reach.register());
            max_sel_reach_size = max_sel_reach_size.max(source.reach.size());
        }

        let mut n_sel_sources = 0;
        let mut orphan_source: Option<(usize, ReferenceId)> = None;

        for (index, source) in self.sources.iter_mut().enumerate() {
            if !source.ok {
                continue;
            }

            if !source.reach.is_reachable() && max_reach_sample_ago < source.sel_info.last_sample_ago
            {
                source.mark(SourceStatus::Stale);
                continue;
            }

            // Sources at or above our orphan stratum are serving orphan time,
            // possibly our own.
            if let Some(orphan_stratum) = ctx.orphan_stratum {
                if source.kind == SourceKind::Ntp && source.sel_info.stratum >= orphan_stratum {
                    source.mark(SourceStatus::Orphan);
                    if source.sel_info.stratum == orphan_stratum
                        && source.reach.is_reachable()
                        && orphan_source.map_or(true, |(_, ref_id)| source.ref_id < ref_id)
                    {
                        orphan_source = Some((index, source.ref_id));
                    }
                    continue;
                }
            }

            n_sel_sources += 1;
        }

        if n_sel_sources == 0 {
            if let Some((index, ref_id)) = orphan_source {
                match ctx.local_ref_id {
                    None => error!("Unknown local reference id in orphan mode"),
                    Some(local_ref_id) if ref_id < local_ref_id => {
                        debug!(%ref_id, "Selecting orphan source");
                        self.sources[index].ok = true;
                        n_sel_sources = 1;
                    }
                    Some(_) => {}
                }
            }
        }

        debug!(
            n_badstats_sources,
            n_sel_sources, max_badstat_reach, max_sel_reach, max_sel_reach_size, max_reach_sample_ago
        );

        // Wait for sources polled at the same rate as the best reachable
        // source to get enough samples before making a first selection.
        if n_badstats_sources > 0
            && n_sel_sources > 0
            && self.selected.is_none()
            && max_sel_reach_size < crate::source::REACH_BITS
            && max_sel_reach >> 1 == max_badstat_reach
        {
            self.mark_ok_sources(SourceStatus::WaitsStats);
            return SelectionOutcome::NoChange;
        }

        if n_sel_sources == 0 {
            return self.give_up("no selectable sources");
        }

        self.endpoints.clear();
        for (index, source) in self.sources.iter().enumerate() {
            if !source.ok {
                continue;
            }
            self.endpoints.push(Endpoint {
                index,
                offset: source.sel_info.lo_limit,
                tag: EndpointTag::Low,
            });
            self.endpoints.push(Endpoint {
                index,
                offset: source.sel_info.hi_limit,
                tag: EndpointTag::High,
            });
        }
        debug_assert_eq!(self.endpoints.len(), 2 * n_sel_sources);

        let best = find_best_interval(&mut self.endpoints);
        debug!(best.depth, best.lo, best.hi, "Best interval");

        if best.depth <= n_sel_sources / 2 {
            let outcome = self.give_up("no majority");
            self.mark_ok_sources(SourceStatus::Falseticker);
            return outcome;
        }

        self.sel_sources.clear();
        for (index, source) in self.sources.iter_mut().enumerate() {
            if !source.ok {
                continue;
            }

            let si = &source.sel_info;
            if (si.lo_limit <= best.lo && si.hi_limit >= best.hi)
                || (si.lo_limit >= best.lo && si.hi_limit <= best.hi)
            {
                self.sel_sources.push(index);
            } else {
                source.mark(SourceStatus::Falseticker);
            }
        }

        if self.sel_sources.is_empty() || self.sel_sources.len() < self.config.min_sources {
            let reason = if self.sel_sources.is_empty() {
                "no selectable sources"
            } else {
                "not enough selectable sources"
            };
            let outcome = self.give_up(reason);
            self.mark_ok_sources(SourceStatus::WaitsSources);
            return outcome;
        }

        let leap = self.leap_vote();

        // With preferred sources around, only those are considered
        if self
            .sel_sources
            .iter()
            .any(|&index| self.sources[index].options.prefer)
        {
            let sources = &mut self.sources;
            self.sel_sources.retain(|&index| {
                let prefer = sources[index].options.prefer;
                if !prefer {
                    sources[index].mark(SourceStatus::NonPreferred);
                }
                prefer
            });
        }

        let min_stratum = self
            .sel_sources
            .iter()
            .map(|&index| self.sources[index].sel_info.stratum)
            .min()
            .expect("admissible sources vanished");

        let stratum_distance = |source: &Source<S>, stratum_weight: f64| {
            source.sel_info.root_distance
                + (source.sel_info.stratum as f64 - min_stratum as f64) * stratum_weight
        };

        let selected = self.selected;
        let sel_src_distance = selected
            .map(|index| stratum_distance(&self.sources[index], self.config.stratum_weight))
            .unwrap_or(0.0);

        let mut max_score = 0.0;
        let mut max_score_index = None;
        for (index, source) in self.sources.iter_mut().enumerate() {
            if !source.ok {
                source.score = 1.0;
                source.distant = DISTANT_PENALTY;
                continue;
            }

            let mut distance = stratum_distance(source, self.config.stratum_weight);
            if source.kind == SourceKind::Ntp {
                distance += self.config.reselect_distance;
            }

            match selected {
                // Only sources compared against a new sample change score
                Some(selected) => {
                    if ctx.updated == Some(index) || ctx.updated == Some(selected) {
                        source.score *= sel_src_distance / distance;
                        if source.score < 1.0 {
                            source.score = 1.0;
                        }
                    }
                }
                None => source.score = 1.0 / distance,
            }

            debug!(ref_id = %source.ref_id, score = source.score, distance, "Score");

            if max_score < source.score {
                max_score = source.score;
                max_score_index = Some(index);
            }
        }

        let max_score_index = max_score_index.expect("no admissible source has a score");

        let selected_ok = selected.map_or(false, |index| self.sources[index].ok);
        if !selected_ok || (Some(max_score_index) != selected && max_score > SCORE_LIMIT) {
            if self.sources[max_score_index].updates == 0 {
                self.selected = None;
                self.mark_ok_sources(SourceStatus::WaitsUpdate);
                return SelectionOutcome::NoChange;
            }

            self.selected = Some(max_score_index);
            info!(ref_id = %self.sources[max_score_index].ref_id, "Selected source");

            for source in &mut self.sources {
                source.score = 1.0;
                source.distant = 0;
            }
        }

        let selected = self.selected.expect("selected source vanished");
        self.sources[selected].mark(SourceStatus::Selected);

        // Nothing new to tell the reference
        if self.sources[selected].updates == 0 {
            for &index in &self.sel_sources {
                let source = &mut self.sources[index];
                if source.ok {
                    let status = if source.distant > 0 {
                        SourceStatus::Distant
                    } else {
                        SourceStatus::Unselected
                    };
                    source.mark(status);
                }
            }
            return SelectionOutcome::NoChange;
        }

        for source in &mut self.sources {
            source.updates = 0;
        }

        let tracking = self.sources[selected].stats.tracking_data();
        let (combined_sources, combined) =
            self.combine_sources(selected, tracking, ctx.max_clock_error);

        debug_assert!(self.sources.iter().all(|source| !source.ok));

        let source = &self.sources[selected];
        SelectionOutcome::Update(ReferenceUpdate {
            stratum: source.sel_info.stratum,
            leap,
            combined_sources,
            ref_id: source.ref_id,
            ip: source.ip,
            ref_time: combined.ref_time,
            offset: combined.offset,
            offset_sd: combined.offset_sd,
            frequency: combined.frequency,
            skew: combined.skew,
            root_delay: combined.root_delay,
            root_dispersion: combined.root_dispersion,
        })
    }

    /// Leap second announced by a majority of the admissible sources.
    fn leap_vote(&self) -> NtpLeap {
        let (mut leap_ins, mut leap_del) = (0, 0);
        for &index in &self.sel_sources {
            match self.sources[index].leap {
                NtpLeap::InsertSecond => leap_ins += 1,
                NtpLeap::DeleteSecond => leap_del += 1,
                _ => {}
            }
        }

        let half = self.sel_sources.len() / 2;
        if leap_ins > half {
            NtpLeap::InsertSecond
        } else if leap_del > half {
            NtpLeap::DeleteSecond
        } else {
            NtpLeap::Normal
        }
    }

    /// Average the estimates of the admissible sources that agree with the
    /// selected source. Returns the number of combined sources.
    fn combine_sources(
        &mut self,
        selected: usize,
        sel: TrackingData,
        max_clock_error: f64,
    ) -> (usize, TrackingData) {
        if self.sel_sources.len() == 1 {
            return (1, sel);
        }

        let sel_src_distance =
            self.sources[selected].sel_info.root_distance + self.config.reselect_distance;

        let mut sum_offset_weight = 0.0;
        let mut sum_offset = 0.0;
        let mut sum2_offset_sd = 0.0;
        let mut sum_frequency_weight = 0.0;
        let mut sum_frequency = 0.0;
        let mut inv_sum2_skew = 0.0;
        let mut combined = 0;

        for &index in &self.sel_sources {
            let source = &mut self.sources[index];
            let src = source.stats.tracking_data();

            if index != selected
                && (source.sel_info.root_distance > self.config.combine_limit * sel_src_distance
                    || (sel.frequency - src.frequency).abs()
                        > self.config.combine_limit * (sel.skew + src.skew + max_clock_error))
            {
                // Smaller penalty during the first polls
                source.distant = if source.reach.is_full() {
                    DISTANT_PENALTY
                } else {
                    1
                };
            } else if source.distant > 0 {
                source.distant -= 1;
            }

            if source.distant > 0 {
                source.mark(SourceStatus::Distant);
                continue;
            }

            if source.ok {
                source.mark(SourceStatus::Unselected);
            }

            let elapsed = sel.ref_time.seconds_since(src.ref_time);
            let src_offset = src.offset + elapsed * src.frequency;
            let offset_weight = 1.0 / source.sel_info.root_distance;
            let frequency_weight = 1.0 / src.skew;

            debug!(
                ref_id = %source.ref_id,
                offset = src_offset,
                offset_weight,
                frequency = src.frequency,
                frequency_weight,
                "Combining"
            );

            sum_offset_weight += offset_weight;
            sum_offset += offset_weight * src_offset;
            sum2_offset_sd += offset_weight
                * (src.offset_sd * src.offset_sd + (src_offset - sel.offset).powi(2));

            sum_frequency_weight += frequency_weight;
            sum_frequency += frequency_weight * src.frequency;
            inv_sum2_skew += 1.0 / (src.skew * src.skew);

            combined += 1;
        }

        assert!(combined > 0, "selected source was not combined");

        (
            combined,
            TrackingData {
                ref_time: sel.ref_time,
                offset: sum_offset / sum_offset_weight,
                offset_sd: (sum2_offset_sd / sum_offset_weight).sqrt(),
                frequency: sum_frequency / sum_frequency_weight,
                skew: 1.0 / inv_sum2_skew.sqrt(),
                root_delay: sel.root_delay,
                root_dispersion: sel.root_dispersion,
            },
        )
    }
}

#[cfg(feature = "fuzz")]
pub fn fuzz_find_interval(intervals: &[(f64, f64)]) {
    let intervals: Vec<(f64, f64)> = intervals
        .iter()
        .filter(|(a, b)| a.is_finite() && b.is_finite())
        .map(|&(a, b)| if a <= b { (a, b) } else { (b, a) })
        .collect();

    let mut endpoints = vec![];
    for (index, &(lo, hi)) in intervals.iter().enumerate() {
        endpoints.push(Endpoint {
            index,
            offset: lo,
            tag: EndpointTag::Low,
        });
        endpoints.push(Endpoint {
            index,
            offset: hi,
            tag: EndpointTag::High,
        });
    }

    let best = find_best_interval(&mut endpoints);

    assert!(best.depth <= intervals.len());
    if !intervals.is_empty() {
        assert!(best.depth >= 1);
        assert!(best.lo <= best.hi);
        let containing = intervals
            .iter()
            .filter(|(lo, hi)| *lo <= best.lo && *hi >= best.hi)
            .count();
        assert!(containing >= best.depth);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::source::{SelectOptions, SelectionData};

    const NOW: i64 = 1_700_000_000;

    #[derive(Debug, Clone)]
    struct TestStats {
        sel: SelectionData,
        tracking: TrackingData,
        resets: Cell<usize>,
        slews: Vec<(f64, f64)>,
        dispersion: f64,
    }

    impl SourceStatistics for TestStats {
        fn selection_data(&self, _now: NtpTimestamp) -> SelectionData {
            self.sel
        }

        fn tracking_data(&self) -> TrackingData {
            self.tracking
        }

        fn accumulate_sample(&mut self, _sample: &Sample) {}

        fn sample_count(&self) -> usize {
            MIN_SAMPLES_FOR_REGRESS
        }

        fn reset(&mut self) {
            self.resets.set(self.resets.get() + 1);
        }

        fn slew_samples(&mut self, _when: NtpTimestamp, dfreq: f64, doffset: f64) {
            self.slews.push((dfreq, doffset));
        }

        fn add_dispersion(&mut self, dispersion: f64) {
            self.dispersion += dispersion;
        }
    }

    fn now() -> NtpTimestamp {
        NtpTimestamp::from_unix(NOW, 0)
    }

    fn stats(offset: f64, root_distance: f64) -> TestStats {
        TestStats {
            sel: SelectionData {
                stratum: 1,
                lo_limit: offset - root_distance,
                hi_limit: offset + root_distance,
                root_distance,
                variance: 1e-8,
                first_sample_ago: 100.0,
                last_sample_ago: 1.0,
                select_ok: true,
            },
            tracking: TrackingData {
                ref_time: now(),
                offset,
                offset_sd: 1e-4,
                frequency: 0.0,
                skew: 1e-6,
                root_delay: 1e-3,
                root_dispersion: 1e-3,
            },
            resets: Cell::new(0),
            slews: vec![],
            dispersion: 0.0,
        }
    }

    fn sample(leap: NtpLeap) -> Sample {
        Sample {
            time: now(),
            offset: 0.0,
            peer_delay: 1e-3,
            peer_dispersion: 1e-3,
            root_delay: 1e-3,
            root_dispersion: 1e-3,
            stratum: 1,
            leap,
        }
    }

    fn ctx(updated: Option<usize>) -> SelectionContext {
        SelectionContext {
            now: now(),
            updated,
            max_clock_error: 1e-6,
            orphan_stratum: None,
            local_ref_id: None,
        }
    }

    fn add(
        selector: &mut SourceSelector<TestStats>,
        stats: TestStats,
        options: SelectOptions,
    ) -> usize {
        let n = selector.len() as u32;
        let index = selector.add_source(Source::new(
            ReferenceId::from_int(0x0A00_0001 + n),
            None,
            SourceKind::Ntp,
            options,
            stats,
        ));
        selector.update_reachability(index, true);
        selector.accumulate_sample(index, &sample(NtpLeap::Normal));
        index
    }

    fn statuses(selector: &SourceSelector<TestStats>) -> Vec<SourceStatus> {
        selector.sources().iter().map(Source::status).collect()
    }

    #[test]
    fn test_interval_sweep() {
        let mut endpoints = vec![];
        for (index, (lo, hi)) in [(-1.0, 1.0), (0.0, 2.0), (0.5, 3.0), (5.0, 6.0)]
            .into_iter()
            .enumerate()
        {
            endpoints.push(Endpoint {
                index,
                offset: hi,
                tag: EndpointTag::High,
            });
            endpoints.push(Endpoint {
                index,
                offset: lo,
                tag: EndpointTag::Low,
            });
        }

        let best = find_best_interval(&mut endpoints);
        assert_eq!(best.depth, 3);
        assert_eq!((best.lo, best.hi), (0.5, 1.0));
    }

    #[test]
    fn test_interval_ties() {
        // touching intervals overlap because low ends sort first
        let mut endpoints = vec![
            Endpoint {
                index: 0,
                offset: 1.0,
                tag: EndpointTag::High,
            },
            Endpoint {
                index: 1,
                offset: 1.0,
                tag: EndpointTag::Low,
            },
            Endpoint {
                index: 0,
                offset: 0.0,
                tag: EndpointTag::Low,
            },
            Endpoint {
                index: 1,
                offset: 2.0,
                tag: EndpointTag::High,
            },
        ];
        let best = find_best_interval(&mut endpoints);
        assert_eq!(best.depth, 2);
        assert_eq!((best.lo, best.hi), (1.0, 1.0));

        // equally deep disjoint intervals keep the first
        let mut endpoints = vec![];
        for (index, (lo, hi)) in [(0.0, 1.0), (2.0, 3.0)].into_iter().enumerate() {
            endpoints.push(Endpoint {
                index,
                offset: lo,
                tag: EndpointTag::Low,
            });
            endpoints.push(Endpoint {
                index,
                offset: hi,
                tag: EndpointTag::High,
            });
        }
        let best = find_best_interval(&mut endpoints);
        assert_eq!(best.depth, 1);
        assert_eq!((best.lo, best.hi), (0.0, 1.0));
    }

    #[test]
    fn test_disjoint_sources_are_falsetickers() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        add(&mut selector, stats(-1.0, 0.1), SelectOptions::default());
        add(&mut selector, stats(0.0, 0.1), SelectOptions::default());
        add(&mut selector, stats(1.0, 0.1), SelectOptions::default());

        assert_eq!(selector.select(&ctx(Some(0))), SelectionOutcome::NoChange);
        assert_eq!(selector.selected(), None);
        assert_eq!(statuses(&selector), vec![SourceStatus::Falseticker; 3]);
    }

    #[test]
    fn test_agreeing_sources_are_combined() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        add(&mut selector, stats(-0.001, 0.01), SelectOptions::default());
        add(&mut selector, stats(0.001, 0.01), SelectOptions::default());

        let SelectionOutcome::Update(update) = selector.select(&ctx(Some(1))) else {
            panic!("expected a reference update");
        };

        assert_eq!(update.combined_sources, 2);
        assert!(update.offset.abs() < 1e-12);
        assert!(update.offset_sd > 1e-4);
        assert!((update.skew - 1e-6 / 2f64.sqrt()).abs() < 1e-12);

        let mut st = statuses(&selector);
        st.sort_by_key(|status| *status as u8);
        assert_eq!(st, vec![SourceStatus::Unselected, SourceStatus::Selected]);
    }

    #[test]
    fn test_reference_clock_combines_with_close_sources() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        let refclock = selector.add_source(Source::new(
            ReferenceId::from_bytes(*b"GPS\0"),
            None,
            SourceKind::RefClock,
            SelectOptions::default(),
            stats(0.0, 0.001),
        ));
        selector.update_reachability(refclock, true);
        selector.accumulate_sample(refclock, &sample(NtpLeap::Normal));

        // within 3 * (0.001 + 0.0001) of the reference clock
        add(&mut selector, stats(0.0, 0.0031), SelectOptions::default());

        let SelectionOutcome::Update(update) = selector.select(&ctx(Some(refclock))) else {
            panic!("expected a reference update");
        };
        assert_eq!(selector.selected(), Some(refclock));
        assert_eq!(update.combined_sources, 2);
        assert_eq!(
            statuses(&selector),
            vec![SourceStatus::Selected, SourceStatus::Unselected]
        );
    }

    #[test]
    fn test_common_point_admits_all() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        for offset in [-0.002, -0.001, 0.0, 0.001, 0.002] {
            add(&mut selector, stats(offset, 0.01), SelectOptions::default());
        }

        let SelectionOutcome::Update(update) = selector.select(&ctx(Some(0))) else {
            panic!("expected a reference update");
        };
        assert_eq!(update.combined_sources, 5);
        assert!(statuses(&selector)
            .iter()
            .all(|status| matches!(status, SourceStatus::Selected | SourceStatus::Unselected)));
    }

    #[test]
    fn test_minority_falseticker() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        add(&mut selector, stats(0.0, 0.01), SelectOptions::default());
        add(&mut selector, stats(0.001, 0.01), SelectOptions::default());
        add(&mut selector, stats(0.5, 0.01), SelectOptions::default());

        assert!(matches!(
            selector.select(&ctx(Some(0))),
            SelectionOutcome::Update(_)
        ));
        assert_eq!(selector.source(2).status(), SourceStatus::Falseticker);
    }

    #[test]
    fn test_hysteresis_keeps_incumbent() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        add(&mut selector, stats(0.0, 0.01), SelectOptions::default());
        assert!(matches!(
            selector.select(&ctx(Some(0))),
            SelectionOutcome::Update(_)
        ));
        assert_eq!(selector.selected(), Some(0));

        // slightly closer, but not by more than the reselect distance
        add(&mut selector, stats(0.0, 0.0099), SelectOptions::default());
        for round in 0..50 {
            let updated = round % 2;
            selector.accumulate_sample(updated, &sample(NtpLeap::Normal));
            selector.select(&ctx(Some(updated)));
            assert_eq!(selector.selected(), Some(0));
            assert!(selector.source(1).score() <= SCORE_LIMIT);
        }
    }

    #[test]
    fn test_better_source_takes_over() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        add(&mut selector, stats(0.0, 0.01), SelectOptions::default());
        selector.select(&ctx(Some(0)));
        assert_eq!(selector.selected(), Some(0));

        let better = add(&mut selector, stats(0.0, 0.001), SelectOptions::default());
        selector.select(&ctx(Some(better)));
        assert_eq!(selector.selected(), Some(0));
        assert!(selector.source(better).score() > 1.0);
        assert!(selector.source(better).score() < SCORE_LIMIT);

        selector.accumulate_sample(better, &sample(NtpLeap::Normal));
        let outcome = selector.select(&ctx(Some(better)));
        assert_eq!(selector.selected(), Some(better));
        assert!(matches!(outcome, SelectionOutcome::Update(_)));
        assert_eq!(selector.source(better).score(), 1.0);
        assert_eq!(selector.source(0).status(), SourceStatus::Distant);
    }

    #[test]
    fn test_prefer_and_noselect() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        add(&mut selector, stats(0.0, 0.001), SelectOptions::default());
        add(
            &mut selector,
            stats(0.0, 0.01),
            SelectOptions {
                prefer: true,
                noselect: false,
            },
        );
        add(
            &mut selector,
            stats(0.0, 0.0001),
            SelectOptions {
                prefer: false,
                noselect: true,
            },
        );

        selector.select(&ctx(Some(0)));
        assert_eq!(selector.selected(), Some(1));
        assert_eq!(
            statuses(&selector),
            vec![
                SourceStatus::NonPreferred,
                SourceStatus::Selected,
                SourceStatus::Unselectable
            ]
        );
    }

    #[test]
    fn test_stale_source() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        add(&mut selector, stats(0.0, 0.01), SelectOptions::default());
        let mut old = stats(0.0, 0.01);
        old.sel.first_sample_ago = 400.0;
        old.sel.last_sample_ago = 200.0;
        let stale = add(&mut selector, old, SelectOptions::default());
        selector.reset_reachability(stale);

        selector.select(&ctx(Some(0)));
        assert_eq!(selector.source(stale).status(), SourceStatus::Stale);
        assert_eq!(selector.selected(), Some(0));
    }

    #[test]
    fn test_waits_for_stats() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        let good = add(&mut selector, stats(0.0, 0.01), SelectOptions::default());
        selector.update_reachability(good, true);

        let mut fresh = stats(0.0, 0.01);
        fresh.sel.select_ok = false;
        add(&mut selector, fresh, SelectOptions::default());

        assert_eq!(selector.select(&ctx(Some(0))), SelectionOutcome::NoChange);
        assert_eq!(
            statuses(&selector),
            vec![SourceStatus::WaitsStats, SourceStatus::BadStats]
        );

        // the other source had its chance
        selector.update_reachability(good, true);
        selector.update_reachability(1, false);
        assert!(matches!(
            selector.select(&ctx(Some(0))),
            SelectionOutcome::Update(_)
        ));
    }

    #[test]
    fn test_waits_for_update() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        let index = selector.add_source(Source::new(
            ReferenceId::from_int(1),
            None,
            SourceKind::RefClock,
            SelectOptions::default(),
            stats(0.0, 0.01),
        ));
        selector.update_reachability(index, true);

        assert_eq!(selector.select(&ctx(None)), SelectionOutcome::NoChange);
        assert_eq!(selector.source(index).status(), SourceStatus::WaitsUpdate);

        selector.accumulate_sample(index, &sample(NtpLeap::Normal));
        assert!(matches!(
            selector.select(&ctx(Some(index))),
            SelectionOutcome::Update(_)
        ));

        // no new sample since the last update
        assert_eq!(selector.select(&ctx(None)), SelectionOutcome::NoChange);
        assert_eq!(selector.source(index).status(), SourceStatus::Selected);
    }

    #[test]
    fn test_min_sources() {
        let mut selector = SourceSelector::new(SelectionConfig {
            min_sources: 2,
            ..Default::default()
        });
        add(&mut selector, stats(0.0, 0.01), SelectOptions::default());
        assert_eq!(selector.select(&ctx(Some(0))), SelectionOutcome::NoChange);
        assert_eq!(selector.source(0).status(), SourceStatus::WaitsSources);

        // losing the second source of a selected pair unsynchronises
        add(&mut selector, stats(0.0, 0.01), SelectOptions::default());
        assert!(matches!(
            selector.select(&ctx(Some(1))),
            SelectionOutcome::Update(_)
        ));
        selector.remove_source(1);
        assert_eq!(
            selector.select(&ctx(None)),
            SelectionOutcome::Unsynchronised
        );
    }

    #[test]
    fn test_leap_vote() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        for _ in 0..3 {
            add(&mut selector, stats(0.0, 0.01), SelectOptions::default());
        }
        selector.accumulate_sample(0, &sample(NtpLeap::InsertSecond));
        selector.accumulate_sample(1, &sample(NtpLeap::InsertSecond));

        let SelectionOutcome::Update(update) = selector.select(&ctx(Some(1))) else {
            panic!("expected a reference update");
        };
        assert_eq!(update.leap, NtpLeap::InsertSecond);

        assert_eq!(selector.selected(), Some(0));
        selector.accumulate_sample(0, &sample(NtpLeap::Normal));
        let SelectionOutcome::Update(update) = selector.select(&ctx(Some(0))) else {
            panic!("expected a reference update");
        };
        assert_eq!(update.leap, NtpLeap::Normal);
    }

    #[test]
    fn test_remove_compacts() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        add(&mut selector, stats(0.0, 0.1), SelectOptions::default());
        add(&mut selector, stats(0.0, 0.001), SelectOptions::default());
        add(&mut selector, stats(0.0, 0.1), SelectOptions::default());
        selector.select(&ctx(Some(1)));
        assert_eq!(selector.selected(), Some(1));

        assert!(!selector.remove_source(0));
        assert_eq!(selector.selected(), Some(0));
        assert_eq!(selector.len(), 2);

        assert!(selector.remove_source(0));
        assert_eq!(selector.selected(), None);
    }

    #[test]
    fn test_orphan_sources() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        let mut orphan = stats(0.0, 0.01);
        orphan.sel.stratum = 5;
        add(&mut selector, orphan, SelectOptions::default());

        let mut context = ctx(Some(0));
        context.orphan_stratum = Some(5);
        context.local_ref_id = Some(ReferenceId::from_int(0x0100_0000));
        assert_eq!(selector.select(&context), SelectionOutcome::NoChange);
        assert_eq!(selector.source(0).status(), SourceStatus::Orphan);

        context.local_ref_id = Some(ReferenceId::from_int(0xFF00_0000));
        assert!(matches!(
            selector.select(&context),
            SelectionOutcome::Update(_)
        ));
    }

    #[test]
    fn test_clock_changes() {
        let mut selector = SourceSelector::new(SelectionConfig::default());
        add(&mut selector, stats(0.0, 0.01), SelectOptions::default());

        let mut change = ClockChange {
            raw: now(),
            cooked: now(),
            dfreq: 1e-6,
            doffset: 0.5,
            kind: ClockChangeKind::Adjust,
        };
        selector.handle_clock_change(&change);
        assert_eq!(selector.source(0).stats().slews, vec![(1e-6, 0.5)]);

        change.kind = ClockChangeKind::UnknownStep;
        selector.handle_clock_change(&change);
        assert_eq!(selector.source(0).stats().resets.get(), 1);

        selector.add_dispersion(0.25);
        assert_eq!(selector.source(0).stats().dispersion, 0.25);
    }
}
