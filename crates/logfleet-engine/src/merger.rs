use crate::transport::QueryStats;
use chrono::{DateTime, Utc};
use logfleet_core::{HostId, LogMessage, MinuteKey, MinuteStat, QueryResponse};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};

/// Merges per-host result streams into the displayed sequence and the
/// fleet-wide minute histogram.
///
/// Each host's messages are kept in the order the host produced them,
/// stacked by round (later rounds cover older ranges). The merge compares
/// only the heads of the per-host streams, so a host-local timestamp
/// regression or inter-host clock skew surfaces as a `decreased_timestamp`
/// flag on the emitted copy instead of triggering unbounded buffering.
#[derive(Debug)]
pub struct ResultMerger {
    window_cap: usize,
    rounds: u32,
    hosts: BTreeMap<HostId, HostBuffer>,
}

#[derive(Debug, Default)]
struct HostBuffer {
    /// round index -> messages in host order. Higher rounds cover ranges
    /// older than lower rounds.
    rounds: BTreeMap<u32, Vec<LogMessage>>,
    minute_stats: BTreeMap<MinuteKey, u64>,
    num_msgs: u64,
}

impl ResultMerger {
    pub fn new(window_cap: usize) -> Self {
        Self {
            window_cap,
            rounds: 0,
            hosts: BTreeMap::new(),
        }
    }

    /// Drop all session state; the next round starts a fresh session.
    pub fn reset(&mut self) {
        self.rounds = 0;
        self.hosts.clear();
    }

    /// Start the next round of the current session and return its index.
    /// Round 0 is the fresh query; later rounds are load-earlier
    /// extensions and grow the display cap by one window.
    pub fn begin_round(&mut self) -> u32 {
        let round = self.rounds;
        self.rounds += 1;
        round
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn push_message(&mut self, round: u32, msg: LogMessage) {
        self.hosts
            .entry(msg.host.clone())
            .or_default()
            .rounds
            .entry(round)
            .or_default()
            .push(msg);
    }

    /// Accumulate minute counts a host reported. Rounds of one session
    /// scan disjoint subranges, so summing per bucket is exact.
    pub fn add_minute_stats(&mut self, host: &HostId, stats: BTreeMap<MinuteKey, u64>) {
        let buffer = self.hosts.entry(host.clone()).or_default();
        for (key, count) in stats {
            *buffer.minute_stats.entry(key).or_insert(0) += count;
        }
    }

    pub fn finish_host_round(&mut self, host: &HostId, stats: &QueryStats) {
        self.hosts.entry(host.clone()).or_default().num_msgs += stats.num_msgs;
    }

    /// Build the complete, authoritative response snapshot.
    pub fn response(&self) -> QueryResponse {
        let cap = self.window_cap * self.rounds.max(1) as usize;

        // Per host: flatten rounds oldest-range-first, preserving the
        // host's own order inside each round.
        let streams: Vec<Vec<&LogMessage>> = self
            .hosts
            .values()
            .map(|buffer| {
                buffer
                    .rounds
                    .iter()
                    .rev()
                    .flat_map(|(_, msgs)| msgs.iter())
                    .collect()
            })
            .collect();

        let mut heap: BinaryHeap<Reverse<(DateTime<Utc>, usize, usize)>> = BinaryHeap::new();
        for (stream_idx, stream) in streams.iter().enumerate() {
            if let Some(first) = stream.first() {
                heap.push(Reverse((first.time, stream_idx, 0)));
            }
        }

        let mut merged: Vec<LogMessage> = Vec::new();
        let mut max_emitted: Option<DateTime<Utc>> = None;
        while let Some(Reverse((time, stream_idx, pos))) = heap.pop() {
            let mut msg = streams[stream_idx][pos].clone();
            msg.decreased_timestamp = max_emitted.is_some_and(|max| time < max);
            if !msg.decreased_timestamp {
                max_emitted = Some(time);
            }
            merged.push(msg);

            if let Some(next) = streams[stream_idx].get(pos + 1) {
                heap.push(Reverse((next.time, stream_idx, pos + 1)));
            }
        }

        if merged.len() > cap {
            let excess = merged.len() - cap;
            merged.drain(..excess);
        }

        let mut minute_stats: BTreeMap<MinuteKey, MinuteStat> = BTreeMap::new();
        let mut num_msgs_total = 0u64;
        for buffer in self.hosts.values() {
            num_msgs_total += buffer.num_msgs;
            for (key, count) in &buffer.minute_stats {
                minute_stats.entry(*key).or_default().num_msgs += count;
            }
        }

        QueryResponse {
            logs: merged,
            minute_stats,
            num_msgs_total,
            loaded_earlier: self.rounds > 1,
        }
    }
}
