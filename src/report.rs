use crate::aggregator::{WorkerOutcome, WorkerState};
use crate::config::Thresholds;
use crate::error::ThresholdError;
use crate::session::Counters;
use crate::transmit::TransmitReport;
use crate::{CardId, StreamKey};

use std::collections::BTreeMap;

/// Final counters for one handle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandleReport {
    pub packets: u64,
    /// Forward gaps and backward jumps
    pub gaps: u64,
    pub backward_jumps: u64,
    pub bytes: u64,
}

/// Final state of the workers driving one card
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardReport {
    pub workers: usize,
    /// How the card's workers wound down. `Faulted` if any of them did
    pub shutdown: Option<WorkerState>,
    /// Why a worker on this card gave up, if one did
    pub fault: Option<String>,
    pub overruns: u64,
    pub unexpected_blocks: u64,
}

/// What a finished session looked like. The caller decides pass/fail with `evaluate`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateReport {
    pub streams: BTreeMap<StreamKey, HandleReport>,
    pub cards: BTreeMap<CardId, CardReport>,
    pub transmit: BTreeMap<StreamKey, TransmitReport>,
    pub total_bytes: u64,
    /// Throughput of the last complete monitor interval, in MB/s
    pub last_throughput_mbps: Option<f64>,
    pub peak_throughput_mbps: Option<f64>,
}

impl AggregateReport {
    pub(crate) fn build(counters: Counters, outcomes: Vec<WorkerOutcome>) -> Self {
        let streams = counters
            .streams
            .into_iter()
            .map(|(key, s)| {
                (
                    key,
                    HandleReport {
                        packets: s.packets,
                        gaps: s.gaps,
                        backward_jumps: s.backward_jumps,
                        bytes: s.bytes,
                    },
                )
            })
            .collect();

        let mut cards: BTreeMap<CardId, CardReport> = counters
            .cards
            .into_iter()
            .map(|(card, c)| {
                (
                    card,
                    CardReport {
                        overruns: c.overruns,
                        unexpected_blocks: c.unexpected_blocks,
                        ..CardReport::default()
                    },
                )
            })
            .collect();

        let mut transmit = BTreeMap::new();
        for outcome in outcomes {
            let card = cards.entry(outcome.card).or_default();
            card.workers += 1;
            if card.shutdown != Some(WorkerState::Faulted) {
                card.shutdown = Some(outcome.shutdown);
            }
            if card.fault.is_none() {
                card.fault = outcome.fault;
            }
            if let Some((key, report)) = outcome.transmit {
                transmit.insert(key, report);
            }
        }

        AggregateReport {
            streams,
            cards,
            transmit,
            total_bytes: counters.total_bytes,
            last_throughput_mbps: counters.last_throughput_mbps,
            peak_throughput_mbps: counters.peak_throughput_mbps,
        }
    }

    pub fn stream(&self, key: StreamKey) -> Option<&HandleReport> {
        self.streams.get(&key)
    }

    pub fn total_packets(&self) -> u64 {
        self.streams.values().map(|s| s.packets).sum()
    }

    pub fn total_gaps(&self) -> u64 {
        self.streams.values().map(|s| s.gaps).sum()
    }

    pub fn faults(&self) -> impl Iterator<Item = (CardId, &str)> + '_ {
        self.cards
            .iter()
            .filter_map(|(card, c)| c.fault.as_ref().map(|f| (*card, f.as_str())))
    }

    /// Every threshold the session failed
    pub fn violations(&self, thresholds: &Thresholds) -> Vec<ThresholdError> {
        let mut violations = Vec::new();

        if let Some(target) = thresholds.target_mbps {
            match self.last_throughput_mbps {
                Some(measured) if measured < target => {
                    violations.push(ThresholdError::BelowTarget { measured, target })
                }
                Some(_) => {}
                None => violations.push(ThresholdError::NotMeasured { target }),
            }
        }

        if let Some(threshold) = thresholds.max_gaps {
            for (key, stream) in &self.streams {
                if stream.gaps >= threshold {
                    violations.push(ThresholdError::TooManyGaps {
                        key: *key,
                        gaps: stream.gaps,
                        threshold,
                    });
                }
            }
        }

        if let Some(threshold) = thresholds.max_late {
            for (key, tx) in &self.transmit {
                if tx.late >= threshold {
                    violations.push(ThresholdError::TooManyLate {
                        key: *key,
                        late: tx.late,
                        threshold,
                    });
                }
            }
        }

        for (card, reason) in self.faults() {
            violations.push(ThresholdError::Faulted {
                card,
                reason: reason.to_string(),
            });
        }

        violations
    }

    /// `Ok` if the session met every threshold, otherwise the first one it missed
    pub fn evaluate(&self, thresholds: &Thresholds) -> Result<(), ThresholdError> {
        match self.violations(thresholds).into_iter().next() {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Handle;

    fn report_with_gaps(gaps: &[u64]) -> AggregateReport {
        let mut report = AggregateReport::default();
        for (i, g) in gaps.iter().enumerate() {
            report.streams.insert(
                StreamKey::new(0, Handle(i as u8)),
                HandleReport {
                    packets: 10,
                    gaps: *g,
                    ..HandleReport::default()
                },
            );
        }
        report
    }

    #[test]
    fn gap_threshold_is_inclusive() {
        let report = report_with_gaps(&[0, 2]);
        let thresholds = Thresholds {
            max_gaps: Some(2),
            ..Thresholds::default()
        };
        assert_eq!(
            report.evaluate(&thresholds),
            Err(ThresholdError::TooManyGaps {
                key: StreamKey::new(0, Handle::A2),
                gaps: 2,
                threshold: 2
            })
        );
        let thresholds = Thresholds {
            max_gaps: Some(3),
            ..Thresholds::default()
        };
        assert_eq!(report.evaluate(&thresholds), Ok(()));
        assert_eq!(report.total_packets(), 20);
        assert_eq!(report.total_gaps(), 2);
    }

    #[test]
    fn throughput_target() {
        let mut report = report_with_gaps(&[0]);
        let thresholds = Thresholds {
            target_mbps: Some(10.),
            ..Thresholds::default()
        };
        assert_eq!(
            report.evaluate(&thresholds),
            Err(ThresholdError::NotMeasured { target: 10. })
        );
        report.last_throughput_mbps = Some(9.5);
        assert!(report.evaluate(&thresholds).is_err());
        report.last_throughput_mbps = Some(10.5);
        assert_eq!(report.evaluate(&thresholds), Ok(()));
    }

    #[test]
    fn late_threshold_checks_transmit_streams() {
        let mut report = report_with_gaps(&[0]);
        let key = StreamKey::new(0, Handle::B1);
        report.transmit.insert(
            key,
            TransmitReport {
                submitted: 10,
                completed: 10,
                late: 4,
                ..TransmitReport::default()
            },
        );
        let thresholds = Thresholds {
            max_late: Some(4),
            ..Thresholds::default()
        };
        assert_eq!(
            report.evaluate(&thresholds),
            Err(ThresholdError::TooManyLate {
                key,
                late: 4,
                threshold: 4
            })
        );
        let thresholds = Thresholds {
            max_late: Some(5),
            ..Thresholds::default()
        };
        assert_eq!(report.evaluate(&thresholds), Ok(()));
    }

    #[test]
    fn faults_always_fail() {
        let mut report = report_with_gaps(&[0]);
        report.cards.insert(
            1,
            CardReport {
                workers: 1,
                fault: Some("receive failed with status -6".to_string()),
                ..CardReport::default()
            },
        );
        let violations = report.violations(&Thresholds::default());
        assert_eq!(violations.len(), 1);
        assert_eq!(report.faults().next(), Some((1, "receive failed with status -6")));
    }
}
