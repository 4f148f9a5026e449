//! Log integrity scanning: sequence gaps and conflicting duplicates.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sequences `from..=to` of `device_id` are missing from the local log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceGap {
    pub device_id: Uuid,
    pub from: u64,
    pub to: u64,
}

impl SequenceGap {
    pub fn contains(&self, device_id: &Uuid, sequence: u64) -> bool {
        self.device_id == *device_id && (self.from..=self.to).contains(&sequence)
    }

    /// Number of missing messages
    pub fn missing(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// Two different messages were seen under the same `(device_id, sequence)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateSequence {
    pub device_id: Uuid,
    pub sequence: u64,
    pub existing_checksum: String,
    pub incoming_checksum: String,
}

/// Result of scanning the local log
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogScan {
    pub gaps: Vec<SequenceGap>,
    pub anomalies: Vec<DuplicateSequence>,
}

impl LogScan {
    pub fn is_clean(&self) -> bool {
        self.gaps.is_empty() && self.anomalies.is_empty()
    }
}

/// What `sync-repair` found and did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    /// Gaps present before repair started
    pub gaps_found: Vec<SequenceGap>,
    /// Messages fetched again from the remote and merged
    pub refetched: usize,
    /// Gaps the remote could not fill
    pub unresolved: Vec<SequenceGap>,
    pub anomalies: Vec<DuplicateSequence>,
    /// Cursor the log was rewound to, if any
    pub rewound_to: Option<u64>,
    /// The log can only be fixed by `sync-reset`
    pub needs_reset: bool,
}

impl RepairReport {
    /// Nothing was wrong
    pub fn is_clean(&self) -> bool {
        self.gaps_found.is_empty() && self.anomalies.is_empty()
    }
}

/// Missing sequence ranges, given `(device, sequence)` pairs sorted by
/// device then sequence. Sequences start at 1.
pub fn find_gaps<I>(sorted: I) -> Vec<SequenceGap>
where
    I: IntoIterator<Item = (Uuid, u64)>,
{
    let mut gaps = Vec::new();
    let mut current: Option<(Uuid, u64)> = None;

    for (device_id, sequence) in sorted {
        let expected = match current {
            Some((device, last)) if device == device_id => last + 1,
            _ => 1,
        };
        if sequence > expected {
            gaps.push(SequenceGap {
                device_id,
                from: expected,
                to: sequence - 1,
            });
        }
        current = Some((device_id, sequence));
    }
    gaps
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_log_has_no_gaps() {
        let a = Uuid::new_v4();
        assert!(find_gaps([(a, 1), (a, 2), (a, 3)]).is_empty());
        assert!(find_gaps(Vec::<(Uuid, u64)>::new()).is_empty());
    }

    #[test]
    fn finds_leading_and_inner_gaps_per_device() {
        let mut devices = [Uuid::new_v4(), Uuid::new_v4()];
        devices.sort();
        let [a, b] = devices;

        let gaps = find_gaps([(a, 1), (a, 4), (a, 5), (a, 7), (b, 3)]);
        assert_eq!(
            gaps,
            vec![
                SequenceGap { device_id: a, from: 2, to: 3 },
                SequenceGap { device_id: a, from: 6, to: 6 },
                SequenceGap { device_id: b, from: 1, to: 2 },
            ]
        );
        assert_eq!(gaps[0].missing(), 2);
        assert!(gaps[0].contains(&a, 3));
        assert!(!gaps[0].contains(&b, 3));
    }

    #[test]
    fn report_cleanliness() {
        assert!(RepairReport::default().is_clean());
        let report = RepairReport {
            gaps_found: vec![SequenceGap {
                device_id: Uuid::nil(),
                from: 1,
                to: 1,
            }],
            ..Default::default()
        };
        assert!(!report.is_clean());
    }
}
