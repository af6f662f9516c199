//! Partition assignment run by the elected group leader.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::group::config::AssignmentStrategy;
use crate::protocol::{JoinGroupMember, MemberAssignment};
use crate::types::TopicPartition;

/// Assigns the partitions of subscribed topics to members.
///
/// `partitions` maps topic name to its partition ids. Every member gets an
/// entry in the result, possibly empty.
pub fn assign(
    strategy: AssignmentStrategy,
    members: &[JoinGroupMember],
    partitions: &HashMap<String, Vec<i32>>,
) -> Vec<MemberAssignment> {
    let mut sorted: Vec<&JoinGroupMember> = members.iter().collect();
    sorted.sort_by(|a, b| a.member_id.cmp(&b.member_id));

    let assigned = match strategy {
        AssignmentStrategy::Range => range(&sorted, partitions),
        AssignmentStrategy::RoundRobin => round_robin(&sorted, partitions),
    };

    sorted
        .iter()
        .map(|m| MemberAssignment {
            member_id: m.member_id.clone(),
            partitions: assigned.get(m.member_id.as_str()).cloned().unwrap_or_default(),
        })
        .collect()
}

/// Per topic, contiguous ranges; the first `n % members` members get one extra.
fn range<'a>(
    members: &[&'a JoinGroupMember],
    partitions: &HashMap<String, Vec<i32>>,
) -> BTreeMap<&'a str, Vec<TopicPartition>> {
    let mut assigned: BTreeMap<&str, Vec<TopicPartition>> = BTreeMap::new();
    for topic in subscribed_topics(members) {
        let Some(ids) = partitions.get(topic) else {
            continue;
        };
        let subscribers: Vec<&str> = members
            .iter()
            .filter(|m| m.subscription.iter().any(|t| t == topic))
            .map(|m| m.member_id.as_str())
            .collect();
        if subscribers.is_empty() {
            continue;
        }

        let per_member = ids.len() / subscribers.len();
        let extra = ids.len() % subscribers.len();
        let mut next = ids.iter();
        for (i, member_id) in subscribers.iter().enumerate() {
            let count = per_member + usize::from(i < extra);
            let slot = assigned.entry(*member_id).or_default();
            for id in next.by_ref().take(count) {
                slot.push(TopicPartition::new(topic, *id));
            }
        }
    }
    assigned
}

/// All partitions sorted, dealt out one at a time to the next subscribed member.
fn round_robin<'a>(
    members: &[&'a JoinGroupMember],
    partitions: &HashMap<String, Vec<i32>>,
) -> BTreeMap<&'a str, Vec<TopicPartition>> {
    let mut assigned: BTreeMap<&str, Vec<TopicPartition>> = BTreeMap::new();
    if members.is_empty() {
        return assigned;
    }

    let mut cursor = 0;
    for topic in subscribed_topics(members) {
        let Some(ids) = partitions.get(topic) else {
            continue;
        };
        for id in ids {
            // skip members not subscribed to this topic
            for _ in 0..members.len() {
                let member = members[cursor % members.len()];
                cursor += 1;
                if member.subscription.iter().any(|t| t == topic) {
                    assigned
                        .entry(member.member_id.as_str())
                        .or_default()
                        .push(TopicPartition::new(topic, *id));
                    break;
                }
            }
        }
    }
    assigned
}

fn subscribed_topics<'a>(members: &[&'a JoinGroupMember]) -> BTreeSet<&'a str> {
    members
        .iter()
        .flat_map(|m| m.subscription.iter().map(String::as_str))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: &str, topics: &[&str]) -> JoinGroupMember {
        JoinGroupMember {
            member_id: id.into(),
            subscription: topics.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn layout(entries: &[(&str, i32)]) -> HashMap<String, Vec<i32>> {
        entries
            .iter()
            .map(|(t, n)| (t.to_string(), (0..*n).collect()))
            .collect()
    }

    fn owned(assignment: &[MemberAssignment], member_id: &str) -> Vec<TopicPartition> {
        assignment
            .iter()
            .find(|a| a.member_id == member_id)
            .map(|a| a.partitions.clone())
            .unwrap_or_default()
    }

    #[test]
    fn range_gives_extra_partitions_to_first_members() {
        let members = [member("b", &["t"]), member("a", &["t"])];
        let result = assign(AssignmentStrategy::Range, &members, &layout(&[("t", 3)]));
        assert_eq!(
            owned(&result, "a"),
            vec![TopicPartition::new("t", 0), TopicPartition::new("t", 1)]
        );
        assert_eq!(owned(&result, "b"), vec![TopicPartition::new("t", 2)]);
    }

    #[test]
    fn round_robin_interleaves_across_topics() {
        let members = [member("a", &["t", "u"]), member("b", &["t", "u"])];
        let result = assign(
            AssignmentStrategy::RoundRobin,
            &members,
            &layout(&[("t", 2), ("u", 1)]),
        );
        assert_eq!(
            owned(&result, "a"),
            vec![TopicPartition::new("t", 0), TopicPartition::new("u", 0)]
        );
        assert_eq!(owned(&result, "b"), vec![TopicPartition::new("t", 1)]);
    }

    #[test]
    fn members_only_get_subscribed_topics() {
        let members = [member("a", &["t"]), member("b", &["u"])];
        for strategy in [AssignmentStrategy::Range, AssignmentStrategy::RoundRobin] {
            let result = assign(strategy, &members, &layout(&[("t", 2), ("u", 1)]));
            assert_eq!(owned(&result, "a").len(), 2);
            assert_eq!(owned(&result, "b"), vec![TopicPartition::new("u", 0)]);
        }
    }

    #[test]
    fn every_member_has_an_entry() {
        let members = [member("a", &["t"]), member("b", &["t"])];
        let result = assign(AssignmentStrategy::Range, &members, &layout(&[("t", 1)]));
        assert_eq!(result.len(), 2);
        assert!(owned(&result, "b").is_empty());
    }
}
