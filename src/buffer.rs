//! Rolling buffers for recent process history.
//!
//! A [`RollingBuffer`] keeps at most `capacity` samples in insertion order.
//! What happens on overflow depends on its [`RollPolicy`]:
//!
//! - `Backward` discards the oldest sample to make room (sliding window).
//! - `Forward` keeps the samples it already has and rejects the new one.
//!
//! Capacity and policy are fixed at construction. Machines that need a
//! different size or policy build fresh buffers instead of resizing.

use crate::error::{AppResult, AutomationError};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

/// Eviction rule applied when appending to a full buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollPolicy {
    /// Discard the oldest sample
    #[default]
    Backward,
    /// Reject the incoming sample
    Forward,
}

impl RollPolicy {
    /// Name used in configuration files and snapshots.
    pub fn as_str(&self) -> &'static str {
        match self {
            RollPolicy::Backward => "backward",
            RollPolicy::Forward => "forward",
        }
    }
}

impl fmt::Display for RollPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollPolicy {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "backward" => Ok(RollPolicy::Backward),
            "forward" => Ok(RollPolicy::Forward),
            other => Err(AutomationError::InvalidAttribute(format!(
                "Invalid buffer roll policy '{}'. Must be one of: backward, forward",
                other
            ))),
        }
    }
}

/// Fixed-capacity time-series container.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingBuffer<T> {
    samples: VecDeque<T>,
    capacity: usize,
    policy: RollPolicy,
}

impl<T> RollingBuffer<T> {
    /// Create an empty buffer.
    ///
    /// # Errors
    /// Returns `InvalidAttribute` if `capacity` is zero.
    pub fn new(capacity: usize, policy: RollPolicy) -> AppResult<Self> {
        if capacity == 0 {
            return Err(AutomationError::InvalidAttribute(
                "buffer capacity must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            policy,
        })
    }

    /// Append a sample, applying the roll policy when full.
    ///
    /// Returns `false` only when a `Forward` buffer rejected the sample.
    pub fn append(&mut self, sample: T) -> bool {
        if self.samples.len() == self.capacity {
            match self.policy {
                RollPolicy::Backward => {
                    self.samples.pop_front();
                }
                RollPolicy::Forward => return false,
            }
        }
        self.samples.push_back(sample);
        true
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A buffer is ready once it holds `capacity` samples.
    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// Eviction rule of this buffer.
    pub fn policy(&self) -> RollPolicy {
        self.policy
    }

    /// Iterate samples oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.samples.iter()
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<&T> {
        self.samples.back()
    }

    /// Drop every sample, keeping capacity and policy.
    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl<T: Clone> RollingBuffer<T> {
    /// Copy the samples out, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.samples.iter().cloned().collect()
    }
}

impl<'a, T> IntoIterator for &'a RollingBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(RollingBuffer::<f64>::new(0, RollPolicy::Backward).is_err());
    }

    #[test]
    fn backward_policy_discards_oldest() {
        let mut buffer = RollingBuffer::new(2, RollPolicy::Backward).unwrap();
        assert!(buffer.append(10));
        assert!(buffer.append(20));
        assert!(buffer.append(30));

        assert_eq!(buffer.to_vec(), vec![20, 30]);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.latest(), Some(&30));
    }

    #[test]
    fn forward_policy_rejects_new_samples() {
        let mut buffer = RollingBuffer::new(2, RollPolicy::Forward).unwrap();
        buffer.append(1);
        buffer.append(2);

        assert!(!buffer.append(3));
        assert_eq!(buffer.to_vec(), vec![1, 2]);
    }

    #[test]
    fn never_exceeds_capacity() {
        let mut buffer = RollingBuffer::new(5, RollPolicy::Backward).unwrap();
        for i in 0..100 {
            buffer.append(i);
            assert!(buffer.len() <= buffer.capacity());
        }
        assert_eq!(buffer.to_vec(), vec![95, 96, 97, 98, 99]);
    }

    #[test]
    fn readiness_tracks_fullness() {
        let mut buffer = RollingBuffer::new(3, RollPolicy::Backward).unwrap();
        buffer.append(1.0);
        buffer.append(2.0);
        assert!(!buffer.is_full());

        buffer.append(3.0);
        assert!(buffer.is_full());

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.capacity(), 3);
    }

    #[test]
    fn iteration_is_restartable() {
        let mut buffer = RollingBuffer::new(3, RollPolicy::Backward).unwrap();
        buffer.append('a');
        buffer.append('b');

        let first: Vec<_> = buffer.iter().collect();
        let second: Vec<_> = (&buffer).into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![&'a', &'b']);
    }

    #[test]
    fn roll_policy_parses_case_insensitively() {
        assert_eq!("Backward".parse::<RollPolicy>().unwrap(), RollPolicy::Backward);
        assert_eq!("forward".parse::<RollPolicy>().unwrap(), RollPolicy::Forward);
        assert!("sideways".parse::<RollPolicy>().is_err());
    }

    #[test]
    fn roll_policy_serializes_lowercase() {
        let json = serde_json::to_string(&RollPolicy::Backward).unwrap();
        assert_eq!(json, "\"backward\"");
    }
}
