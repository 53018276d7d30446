//! Viewer count aggregation
//!
//! Relays report the size of their sub-tree (themselves plus connected
//! sub-viewers). The broadcaster counts its connected direct viewers itself
//! and takes each connected relay's latest report in place of the relay.

use std::collections::HashMap;

use crate::types::ParticipantId;

#[derive(Debug, Default)]
pub struct ViewerCountAggregator {
    /// Latest sub-tree size per relay
    reports: HashMap<ParticipantId, u64>,
    last_published: Option<u64>,
}

impl ViewerCountAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a relay's report; a later report replaces an earlier one, so
    /// duplicated deliveries are harmless.
    pub fn record(&mut self, relay: ParticipantId, count: u64) {
        self.reports.insert(relay, count);
    }

    /// Drop a relay's report; its sub-tree counts as zero until it reports again
    pub fn forget(&mut self, relay: &ParticipantId) -> Option<u64> {
        self.reports.remove(relay)
    }

    #[must_use]
    pub fn reported(&self, relay: &ParticipantId) -> Option<u64> {
        self.reports.get(relay).copied()
    }

    /// Total audience: connected direct viewers plus every connected
    /// relay's sub-tree. A relay that has not reported yet counts as one.
    #[must_use]
    pub fn total<'a>(
        &self,
        connected_direct: usize,
        connected_relays: impl IntoIterator<Item = &'a ParticipantId>,
    ) -> u64 {
        let relayed: u64 = connected_relays
            .into_iter()
            .map(|relay| self.reports.get(relay).copied().unwrap_or(1).max(1))
            .sum();
        connected_direct as u64 + relayed
    }

    /// Returns `total` if it differs from the last published value and
    /// remembers it as published.
    pub fn take_publishable(&mut self, total: u64) -> Option<u64> {
        if self.last_published == Some(total) {
            return None;
        }
        self.last_published = Some(total);
        Some(total)
    }

    /// Forget the last published value so the next total is published again
    pub fn reset_published(&mut self) {
        self.last_published = None;
    }

    pub fn clear(&mut self) {
        self.reports.clear();
        self.last_published = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_report_replaces_relay_itself() {
        let mut agg = ViewerCountAggregator::new();
        let relay = ParticipantId::from("a");
        agg.record(relay.clone(), 3);

        // One direct viewer plus relay "a" with two sub-viewers
        assert_eq!(agg.total(1, [&relay]), 4);
    }

    #[test]
    fn test_unreported_relay_counts_once() {
        let agg = ViewerCountAggregator::new();
        let relay = ParticipantId::from("a");
        assert_eq!(agg.total(2, [&relay]), 3);
    }

    #[test]
    fn test_forget_and_duplicates() {
        let mut agg = ViewerCountAggregator::new();
        let relay = ParticipantId::from("a");
        agg.record(relay.clone(), 3);
        agg.record(relay.clone(), 3);
        assert_eq!(agg.reported(&relay), Some(3));

        assert_eq!(agg.forget(&relay), Some(3));
        assert_eq!(agg.total(0, std::iter::empty()), 0);
    }

    #[test]
    fn test_publish_only_changes() {
        let mut agg = ViewerCountAggregator::new();
        assert_eq!(agg.take_publishable(0), Some(0));
        assert_eq!(agg.take_publishable(0), None);
        assert_eq!(agg.take_publishable(2), Some(2));

        agg.clear();
        assert_eq!(agg.take_publishable(2), Some(2));
    }
}
