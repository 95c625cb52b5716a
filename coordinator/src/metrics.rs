//! Counters read by the monitoring side
//!
//! The counters form a [`measured`] group: [`Metrics::encode`] renders them in
//! the Prometheus text format and [`Metrics::snapshot`] copies them for
//! `status()`.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard, PoisonError};

use measured::label::{LabelGroupVisitor, LabelName, LabelValue, LabelVisitor};
use measured::metric::MetricEncoding;
use measured::metric::counter::{CounterState, write_counter};
use measured::metric::group::Encoding;
use measured::metric::name::MetricName;
use measured::text::BufferedTextEncoder;
use measured::{Counter, MetricGroup};
use serde::{Deserialize, Serialize};

use crate::cluster::Specialization;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(MetricGroup)]
#[metric(new())]
pub struct CoordinatorMetrics {
    /// Consensus rounds started by this node
    pub consensus_rounds_attempted_total: Counter,
    /// Rounds that ended with a majority accepting
    pub consensus_rounds_decided_total: Counter,
    pub consensus_rounds_failed_total: Counter,

    /// Assignments answered from the store without a round
    pub fast_path_hits_total: Counter,
    /// Decisions that missed at least one replica
    pub replication_shortfalls_total: Counter,

    #[metric(flatten)]
    assignments: AssignmentCounts,
}

/// Assignments per requested specialization. The label set is only known at
/// runtime, so this group writes its own series.
#[derive(Default)]
pub struct AssignmentCounts {
    by_specialization: Mutex<BTreeMap<Specialization, u64>>,
}

struct SpecializationLabel<'a>(&'a Specialization);

impl LabelValue for SpecializationLabel<'_> {
    fn visit<V: LabelVisitor>(&self, v: V) -> V::Output {
        v.write_str(self.0.as_str())
    }
}

impl measured::label::LabelGroup for SpecializationLabel<'_> {
    fn visit_values(&self, v: &mut impl LabelGroupVisitor) {
        const NAME: &LabelName = LabelName::from_str("specialization");
        v.write_value(NAME, self);
    }
}

impl<Enc: Encoding> MetricGroup<Enc> for AssignmentCounts
where
    CounterState: MetricEncoding<Enc>,
{
    fn collect_group_into(&self, enc: &mut Enc) -> Result<(), Enc::Err> {
        const NAME: &MetricName = MetricName::from_str("agent_assignments_total");

        enc.write_help(NAME, "assignments by requested specialization")?;
        for (specialization, count) in lock(&self.by_specialization).iter() {
            write_counter(enc, NAME, SpecializationLabel(specialization), *count)?;
        }
        Ok(())
    }
}

/// Point-in-time copy of [`Metrics`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub consensus_rounds_attempted: u64,
    pub consensus_rounds_decided: u64,
    pub consensus_rounds_failed: u64,
    pub fast_path_hits: u64,
    pub replication_shortfalls: u64,
    pub agent_assignments_by_specialization: BTreeMap<Specialization, u64>,
}

pub struct Metrics {
    group: CoordinatorMetrics,
    encoder: Mutex<BufferedTextEncoder>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            group: CoordinatorMetrics::new(),
            encoder: Mutex::default(),
        }
    }
}

fn count(counter: &Counter) -> u64 {
    counter.get_metric().count.load(Ordering::Relaxed)
}

impl Metrics {
    /// Account for the rounds of one `propose` call.
    pub fn record_rounds(&self, attempted: u32, decided: u32, failed: u32) {
        let group = &self.group;
        group
            .consensus_rounds_attempted_total
            .inc_by(u64::from(attempted));
        group.consensus_rounds_decided_total.inc_by(u64::from(decided));
        group.consensus_rounds_failed_total.inc_by(u64::from(failed));
    }

    pub fn record_fast_path(&self) {
        self.group.fast_path_hits_total.inc();
    }

    pub fn record_replication_shortfall(&self) {
        self.group.replication_shortfalls_total.inc();
    }

    pub fn record_assignment(&self, specialization: &Specialization) {
        *lock(&self.group.assignments.by_specialization)
            .entry(specialization.clone())
            .or_default() += 1;
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let group = &self.group;
        MetricsSnapshot {
            consensus_rounds_attempted: count(&group.consensus_rounds_attempted_total),
            consensus_rounds_decided: count(&group.consensus_rounds_decided_total),
            consensus_rounds_failed: count(&group.consensus_rounds_failed_total),
            fast_path_hits: count(&group.fast_path_hits_total),
            replication_shortfalls: count(&group.replication_shortfalls_total),
            agent_assignments_by_specialization: lock(&group.assignments.by_specialization)
                .clone(),
        }
    }

    /// Every counter in the Prometheus text format
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = lock(&self.encoder);
        let Ok(()) = self.group.collect_group_into(&mut *encoder);
        encoder.finish().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_accumulates() {
        let metrics = Metrics::default();
        metrics.record_rounds(3, 1, 2);
        metrics.record_rounds(1, 1, 0);
        metrics.record_fast_path();
        metrics.record_assignment(&Specialization::new("support"));
        metrics.record_assignment(&Specialization::new("support"));
        metrics.record_assignment(&Specialization::general());

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.consensus_rounds_attempted, 4);
        assert_eq!(snapshot.consensus_rounds_decided, 2);
        assert_eq!(snapshot.consensus_rounds_failed, 2);
        assert_eq!(snapshot.fast_path_hits, 1);
        assert_eq!(
            snapshot.agent_assignments_by_specialization[&Specialization::new("support")],
            2
        );
        assert_eq!(
            snapshot.agent_assignments_by_specialization[&Specialization::general()],
            1
        );
    }

    #[test]
    fn test_encode_prometheus_text() {
        let metrics = Metrics::default();
        metrics.record_rounds(2, 1, 1);
        metrics.record_replication_shortfall();
        metrics.record_assignment(&Specialization::new("billing"));

        let text = String::from_utf8(metrics.encode()).unwrap();
        assert!(text.contains("consensus_rounds_attempted_total 2"), "{text}");
        assert!(text.contains("replication_shortfalls_total 1"), "{text}");
        assert!(
            text.contains(r#"agent_assignments_total{specialization="billing"} 1"#),
            "{text}"
        );
    }
}
