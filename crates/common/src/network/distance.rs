use std::collections::{BTreeMap, HashMap, VecDeque};

use regex::Regex;

use super::NetworkLink;
use crate::crypto::PublicKey;

/// Result of a distance evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reach {
    pub in_network: bool,
    /// Minimum number of hops found, if the peer was reached at all
    pub distance: Option<u32>,
}

impl Reach {
    pub const UNREACHABLE: Reach = Reach {
        in_network: false,
        distance: None,
    };
}

/// Breadth-first search over a snapshot of network links
///
/// Only edges whose relation matches the pattern (when one is given) are followed, so
/// a peer counts as reached at distance `d` only if every edge on some path of length
/// `d` carries a matching relation.
#[derive(Debug)]
pub struct DistanceEvaluator<'a> {
    origin: PublicKey,
    links: &'a [NetworkLink],
}

impl<'a> DistanceEvaluator<'a> {
    pub fn new(origin: PublicKey, links: &'a [NetworkLink]) -> Self {
        Self { origin, links }
    }

    /// Is `peer` within `bound` hops of the origin?
    pub fn distance(&self, peer: &PublicKey, bound: u32, relation: Option<&Regex>) -> Reach {
        if *peer == self.origin {
            return Reach::UNREACHABLE;
        }
        match self.reachable(bound, relation).get(peer) {
            Some(&d) => Reach {
                in_network: true,
                distance: Some(d),
            },
            None => Reach::UNREACHABLE,
        }
    }

    /// Every member within `bound` hops of the origin, with its minimum distance
    pub fn reachable(&self, bound: u32, relation: Option<&Regex>) -> BTreeMap<PublicKey, u32> {
        let mut adjacency: HashMap<PublicKey, Vec<PublicKey>> = HashMap::new();
        for link in self.links {
            if relation.map_or(true, |re| re.is_match(&link.relation)) {
                adjacency.entry(link.owner).or_default().push(link.peer);
            }
        }

        let mut seen = BTreeMap::new();
        let mut queue = VecDeque::from([(self.origin, 0u32)]);
        while let Some((member, depth)) = queue.pop_front() {
            if depth == bound {
                continue;
            }
            let Some(next) = adjacency.get(&member) else {
                continue;
            };
            for peer in next {
                if *peer == self.origin || seen.contains_key(peer) {
                    continue;
                }
                seen.insert(*peer, depth + 1);
                queue.push_back((*peer, depth + 1));
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

    fn key() -> PublicKey {
        SecretKey::generate().public()
    }

    fn anchored(pattern: &str) -> Regex {
        Regex::new(&format!("^(?:{})$", pattern)).unwrap()
    }

    #[test]
    fn test_friend_of_friend() {
        let (a, b, c) = (key(), key(), key());
        let links = vec![
            NetworkLink::new(a, b, "friend"),
            NetworkLink::new(b, c, "friend"),
        ];
        let eval = DistanceEvaluator::new(a, &links);

        assert_eq!(eval.distance(&c, 1, None), Reach::UNREACHABLE);
        assert_eq!(
            eval.distance(&c, 2, None),
            Reach {
                in_network: true,
                distance: Some(2)
            }
        );
        assert_eq!(eval.distance(&b, 2, None).distance, Some(1));
    }

    #[test]
    fn test_minimum_distance_over_paths() {
        let (a, b, c, d) = (key(), key(), key(), key());
        let links = vec![
            NetworkLink::new(a, b, "friend"),
            NetworkLink::new(b, c, "friend"),
            NetworkLink::new(c, d, "friend"),
            NetworkLink::new(a, d, "friend"),
        ];
        let eval = DistanceEvaluator::new(a, &links);
        assert_eq!(eval.distance(&d, 3, None).distance, Some(1));
    }

    #[test]
    fn test_relation_must_match_along_path() {
        let (a, b, c) = (key(), key(), key());
        let links = vec![
            NetworkLink::new(a, b, "colleague"),
            NetworkLink::new(b, c, "friend"),
        ];
        let eval = DistanceEvaluator::new(a, &links);
        let friend = anchored("friend");

        assert!(!eval.distance(&b, 2, Some(&friend)).in_network);
        assert!(!eval.distance(&c, 2, Some(&friend)).in_network);
        assert!(eval.distance(&c, 2, Some(&anchored("friend|colleague"))).in_network);
    }

    #[test]
    fn test_cycles_and_self() {
        let (a, b) = (key(), key());
        let links = vec![NetworkLink::new(a, b, "x"), NetworkLink::new(b, a, "x")];
        let eval = DistanceEvaluator::new(a, &links);
        assert!(!eval.distance(&a, 5, None).in_network);
        assert_eq!(eval.reachable(5, None).len(), 1);
        assert!(eval.reachable(0, None).is_empty());
    }

    #[test]
    fn test_edges_not_leaving_origin_are_ignored() {
        let (a, b, c) = (key(), key(), key());
        let links = vec![NetworkLink::new(b, c, "friend")];
        let eval = DistanceEvaluator::new(a, &links);
        assert!(eval.reachable(3, None).is_empty());
    }
}
