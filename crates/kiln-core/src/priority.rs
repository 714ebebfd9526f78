//! Priority normalization and mapping.
//!
//! Numeric priorities map to a queue (which list the dispatcher drains) and
//! to a workload priority class (what the pod scheduler sees). Legacy
//! `-1/0/1` submissions are normalized onto the numeric scale first.

use std::fmt;

use crate::queue::QueueName;

/// Workload priority classes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    Critical,
    High,
    Normal,
    TestInfrastructure,
    TestHigh,
    TestNormal,
    TestLow,
    Low,
}

impl PriorityClass {
    /// The priority-class resource name used on workloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical-priority",
            Self::High => "high-priority-evaluation",
            Self::Normal => "normal-priority-evaluation",
            Self::TestInfrastructure => "test-infrastructure-priority",
            Self::TestHigh => "test-high-priority-evaluation",
            Self::TestNormal => "test-normal-priority-evaluation",
            Self::TestLow => "test-low-priority-evaluation",
            Self::Low => "low-priority-evaluation",
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a numeric priority to its workload priority class.
pub fn priority_class(priority: i32) -> PriorityClass {
    match priority {
        p if p >= 2000 => PriorityClass::Critical,
        1000..=1999 => PriorityClass::High,
        500..=999 => PriorityClass::Normal,
        400..=499 => PriorityClass::TestInfrastructure,
        350..=399 => PriorityClass::TestHigh,
        250..=349 => PriorityClass::TestNormal,
        150..=249 => PriorityClass::TestLow,
        _ => PriorityClass::Low,
    }
}

/// Map a numeric priority to the queue it is enqueued on.
pub fn queue_for_priority(priority: i32) -> QueueName {
    if priority >= 1000 {
        QueueName::HighPriority
    } else if priority >= 250 {
        QueueName::Evaluation
    } else {
        QueueName::LowPriority
    }
}

/// Normalize legacy `-1/0/1` priority values onto the numeric scale.
///
/// Anything outside the legacy range passes through unchanged.
pub fn normalize_priority(priority: i32) -> i32 {
    match priority {
        -1 => 150,
        0 => 250,
        1 => 350,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_thresholds() {
        assert_eq!(queue_for_priority(2500), QueueName::HighPriority);
        assert_eq!(queue_for_priority(1000), QueueName::HighPriority);
        assert_eq!(queue_for_priority(999), QueueName::Evaluation);
        assert_eq!(queue_for_priority(250), QueueName::Evaluation);
        assert_eq!(queue_for_priority(249), QueueName::LowPriority);
        assert_eq!(queue_for_priority(0), QueueName::LowPriority);
    }

    #[test]
    fn class_boundaries() {
        assert_eq!(priority_class(2000), PriorityClass::Critical);
        assert_eq!(priority_class(1999), PriorityClass::High);
        assert_eq!(priority_class(1000), PriorityClass::High);
        assert_eq!(priority_class(999), PriorityClass::Normal);
        assert_eq!(priority_class(500), PriorityClass::Normal);
        assert_eq!(priority_class(499), PriorityClass::TestInfrastructure);
        assert_eq!(priority_class(399), PriorityClass::TestHigh);
        assert_eq!(priority_class(349), PriorityClass::TestNormal);
        assert_eq!(priority_class(249), PriorityClass::TestLow);
        assert_eq!(priority_class(149), PriorityClass::Low);
        assert_eq!(priority_class(-5), PriorityClass::Low);
    }

    #[test]
    fn legacy_values_normalize() {
        assert_eq!(normalize_priority(-1), 150);
        assert_eq!(normalize_priority(0), 250);
        assert_eq!(normalize_priority(1), 350);
        assert_eq!(normalize_priority(42), 42);
        assert_eq!(normalize_priority(1000), 1000);
    }

    #[test]
    fn normalized_legacy_lands_in_expected_queue() {
        // Legacy 1 ("high") maps to the test-high band, which still drains
        // through the default evaluation queue.
        assert_eq!(queue_for_priority(normalize_priority(1)), QueueName::Evaluation);
        assert_eq!(
            queue_for_priority(normalize_priority(-1)),
            QueueName::LowPriority
        );
    }
}
