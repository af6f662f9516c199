use std::collections::{HashMap, VecDeque};

use bytes::Bytes;

use crate::constants::{EARLIEST_TIME, LATEST_TIME};
use crate::memory::group::CommittedOffset;
use crate::protocol::Record;

#[derive(Debug)]
pub struct Partition {
    id: i32,
    log: PartitionLog,
    leader: Option<i32>, // broker ID of the leader
    // V0 commits live next to the log they describe
    group_offsets: HashMap<String, CommittedOffset>,
}

#[derive(Debug, Default)]
pub struct PartitionLog {
    messages: VecDeque<Record>,
    base_offset: i64,
    next_offset: i64,
}

impl PartitionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// drops records older than `offset`, moving the log start forward
    pub fn truncate_before(&mut self, offset: i64) {
        let offset = offset.min(self.next_offset);
        while let Some(front) = self.messages.front() {
            if front.offset >= offset {
                break;
            }
            self.messages.pop_front();
        }
        self.base_offset = self.base_offset.max(offset);
    }

    fn offset_for_timestamp(&self, timestamp: i64) -> Option<i64> {
        self.messages
            .iter()
            .find(|record| record.timestamp >= timestamp)
            .map(|record| record.offset)
    }
}

impl Partition {
    pub fn new(id: i32, leader: Option<i32>) -> Self {
        Partition {
            id,
            log: PartitionLog::new(),
            leader,
            group_offsets: HashMap::new(),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn append(&mut self, key: Option<Bytes>, value: Bytes, timestamp: i64) -> i64 {
        // assign unique offset to new message
        let offset = self.log.next_offset;
        self.log.messages.push_back(Record {
            offset,
            timestamp,
            key,
            value,
        });
        self.log.next_offset += 1;
        offset
    }

    // pull records starting from a specific offset
    pub fn read_from(&self, offset: i64, max_records: usize) -> Vec<Record> {
        self.log
            .messages
            .iter()
            .filter(|record| record.offset >= offset)
            .take(max_records)
            .cloned()
            .collect()
    }

    pub fn truncate_before(&mut self, offset: i64) {
        self.log.truncate_before(offset);
    }

    pub fn high_watermark(&self) -> i64 {
        self.log.next_offset
    }

    pub fn log_start_offset(&self) -> i64 {
        self.log.base_offset
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn in_range(&self, offset: i64) -> bool {
        offset >= self.log_start_offset() && offset <= self.high_watermark()
    }

    /// Candidate offsets for a time lookup, most relevant first.
    pub fn list_offsets(&self, time: i64, max_num: i32) -> Vec<i64> {
        let mut offsets = match time {
            LATEST_TIME => vec![self.high_watermark(), self.log_start_offset()],
            EARLIEST_TIME => vec![self.log_start_offset()],
            timestamp => vec![self
                .log
                .offset_for_timestamp(timestamp)
                .unwrap_or_else(|| self.high_watermark())],
        };
        offsets.dedup();
        offsets.truncate(max_num.max(1) as usize);
        offsets
    }

    pub fn leader(&self) -> Option<i32> {
        self.leader
    }

    pub fn set_leader(&mut self, broker_id: Option<i32>) {
        self.leader = broker_id;
    }

    pub fn commit(&mut self, group_id: &str, committed: CommittedOffset) {
        self.group_offsets.insert(group_id.to_string(), committed);
    }

    pub fn committed(&self, group_id: &str) -> Option<&CommittedOffset> {
        self.group_offsets.get(group_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(count: i64) -> Partition {
        let mut partition = Partition::new(0, Some(1));
        for i in 0..count {
            partition.append(None, Bytes::from(format!("m{i}")), 1_000 + i * 10);
        }
        partition
    }

    #[test]
    fn empty_partition_reports_single_latest_offset() {
        let partition = Partition::new(0, Some(1));
        assert_eq!(partition.list_offsets(LATEST_TIME, 1), vec![0]);
        assert_eq!(partition.list_offsets(LATEST_TIME, 5), vec![0]);
        assert_eq!(partition.list_offsets(EARLIEST_TIME, 1), vec![0]);
    }

    #[test]
    fn latest_candidates_include_log_start() {
        let mut partition = filled(5);
        partition.truncate_before(2);
        assert_eq!(partition.list_offsets(LATEST_TIME, 1), vec![5]);
        assert_eq!(partition.list_offsets(LATEST_TIME, 2), vec![5, 2]);
        assert_eq!(partition.list_offsets(EARLIEST_TIME, 1), vec![2]);
    }

    #[test]
    fn timestamp_lookup_finds_first_record_at_or_after() {
        let partition = filled(5);
        assert_eq!(partition.list_offsets(1_015, 1), vec![2]);
        assert_eq!(partition.list_offsets(9_999, 1), vec![5]);
    }

    #[test]
    fn truncation_moves_range() {
        let mut partition = filled(4);
        partition.truncate_before(3);
        assert_eq!(partition.len(), 1);
        assert!(!partition.in_range(1));
        assert!(partition.in_range(3));
        assert!(partition.in_range(4));
        assert!(!partition.in_range(5));
        assert_eq!(partition.read_from(0, 10)[0].offset, 3);
    }
}
