use crate::dedup::config::DedupConfig;
use crate::dedup::similarity::{match_reason, Fingerprint};
use crate::resolver::sha256_hex;
use crate::types::{ArtifactObservation, DuplicateGroup, GroupLink};
use rayon::prelude::*;
use std::collections::BTreeMap;

/// Disjoint-set forest over observation indexes.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// Stable group id: a digest of the smallest member id.
pub fn group_id_for(smallest_member: &str) -> String {
    format!("grp-{}", &sha256_hex(smallest_member.as_bytes())[..16])
}

/// Partition observations into groups of the same artifact.
///
/// Every observation lands in exactly one group (singletons included).
/// Groups are connected components of the similarity graph, so links are
/// transitive. The result depends only on the set of observations, not on
/// their order.
pub fn find_duplicates(observations: &[ArtifactObservation], config: &DedupConfig) -> Vec<DuplicateGroup> {
    let mut fingerprints: Vec<Fingerprint> = observations.iter().map(Fingerprint::of).collect();
    fingerprints.sort_by(|a, b| a.id.cmp(&b.id));
    fingerprints.dedup_by(|a, b| a.id == b.id);

    let n = fingerprints.len();
    let edges: Vec<(usize, usize, GroupLink)> = (0..n)
        .into_par_iter()
        .flat_map_iter(|i| {
            let fingerprints = &fingerprints;
            (i + 1..n).filter_map(move |j| {
                match_reason(&fingerprints[i], &fingerprints[j], config).map(|reason| {
                    (
                        i,
                        j,
                        GroupLink {
                            a: fingerprints[i].id.clone(),
                            b: fingerprints[j].id.clone(),
                            reason,
                        },
                    )
                })
            })
        })
        .collect();

    let mut sets = UnionFind::new(n);
    for (i, j, _) in &edges {
        sets.union(*i, *j);
    }

    // Keyed by smallest member index, which is also the smallest id
    let mut components: BTreeMap<usize, (Vec<usize>, Vec<GroupLink>)> = BTreeMap::new();
    let mut root_to_first: BTreeMap<usize, usize> = BTreeMap::new();
    for i in 0..n {
        let root = sets.find(i);
        let first = *root_to_first.entry(root).or_insert(i);
        components.entry(first).or_default().0.push(i);
    }
    for (i, _, link) in edges {
        let first = root_to_first[&sets.find(i)];
        if let Some(component) = components.get_mut(&first) {
            component.1.push(link);
        }
    }

    components
        .into_values()
        .map(|(members, match_reasons)| {
            let member_observation_ids: Vec<_> =
                members.iter().map(|&i| fingerprints[i].id.clone()).collect();
            DuplicateGroup {
                group_id: group_id_for(&member_observation_ids[0]),
                member_observation_ids,
                match_reasons,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use crate::types::{MatchReason, PerceptualHash, SourceKind};
    use proptest::prelude::*;

    fn scraped(source: &str) -> ArtifactObservation {
        ArtifactObservation::new(source, SourceKind::WebScrape, Network::Ethereum)
    }

    fn members(groups: &[DuplicateGroup]) -> Vec<Vec<String>> {
        groups.iter().map(|g| g.member_observation_ids.clone()).collect()
    }

    #[test]
    fn test_blockchain_identity_links_sources() {
        let a = scraped("s1").with_token("0xaa", "7").with_title("Sunset");
        let b = scraped("s2").with_token("0xaa", "7").with_title("Sunset Study");
        let c = scraped("s3").with_token("0xaa", "8").with_title("Harbour");

        let groups = find_duplicates(&[a.clone(), b.clone(), c.clone()], &DedupConfig::default());
        assert_eq!(groups.len(), 2);
        let pair = groups.iter().find(|g| g.member_observation_ids.len() == 2).unwrap();
        assert!(pair.member_observation_ids.contains(&a.id));
        assert!(pair.member_observation_ids.contains(&b.id));
        assert_eq!(pair.match_reasons[0].reason, MatchReason::BlockchainIdentity);
    }

    #[test]
    fn test_transitive_links_merge_into_one_group() {
        // A~B by image, B~C by title, A and C unrelated on their own.
        let a = scraped("a").with_title("Blue Hour").with_perceptual_hash(PerceptualHash(0));
        let b = scraped("b")
            .with_title("Sunset over the harbour")
            .with_perceptual_hash(PerceptualHash(0b111));
        let c = scraped("c")
            .with_title("Sunset over the harbor")
            .with_perceptual_hash(PerceptualHash(u64::MAX));

        let config = DedupConfig::default();
        assert!(match_reason(&Fingerprint::of(&a), &Fingerprint::of(&c), &config).is_none());

        let groups = find_duplicates(&[a, b, c], &config);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].member_observation_ids.len(), 3);
        assert_eq!(groups[0].match_reasons.len(), 2);
    }

    #[test]
    fn test_phash_threshold_controls_grouping() {
        let a = scraped("a").with_perceptual_hash(PerceptualHash(0));
        let b = scraped("b").with_perceptual_hash(PerceptualHash(0b1111));
        let observations = [a, b];

        let loose = find_duplicates(&observations, &DedupConfig::new().with_phash_threshold(5));
        assert_eq!(loose.len(), 1);

        let strict = find_duplicates(&observations, &DedupConfig::new().with_phash_threshold(3));
        assert_eq!(strict.len(), 2);
    }

    #[test]
    fn test_generic_titles_never_link() {
        let a = scraped("a").with_title("Untitled");
        let b = scraped("b").with_title("Untitled");
        assert_eq!(find_duplicates(&[a, b], &DedupConfig::default()).len(), 2);
    }

    #[test]
    fn test_source_url_links() {
        let a = scraped("a").with_source_url("https://gallery.example/works/42/");
        let b = scraped("b").with_source_url("https://gallery.example/works/42");
        assert_eq!(find_duplicates(&[a, b], &DedupConfig::default()).len(), 1);
    }

    /// Observation features only; ids are assigned by position so they stay unique.
    fn arbitrary_features() -> impl Strategy<Value = (Option<u64>, Option<u64>, Option<String>)> {
        (
            proptest::option::of(0u64..4),
            proptest::option::of(0u64..64),
            proptest::option::of("(sunset|sunrise|harbor|harbour) (study|sketch)"),
        )
    }

    fn build(features: &[(Option<u64>, Option<u64>, Option<String>)]) -> Vec<ArtifactObservation> {
        features
            .iter()
            .enumerate()
            .map(|(i, (token, hash, title))| {
                let mut obs = scraped(&format!("src{}", i));
                if let Some(token) = token {
                    obs = obs.with_token("0xaa", token.to_string());
                }
                if let Some(hash) = hash {
                    obs = obs.with_perceptual_hash(PerceptualHash(*hash));
                }
                if let Some(title) = title {
                    obs = obs.with_title(title.clone());
                }
                obs
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_grouping_is_idempotent_and_order_independent(
            features in proptest::collection::vec(arbitrary_features(), 0..12)
        ) {
            let observations = build(&features);
            let config = DedupConfig::default();
            let first = find_duplicates(&observations, &config);
            let second = find_duplicates(&observations, &config);
            prop_assert_eq!(&first, &second);

            let mut reversed = observations.clone();
            reversed.reverse();
            let third = find_duplicates(&reversed, &config);
            prop_assert_eq!(members(&first), members(&third));

            let mut seen: Vec<String> = first
                .iter()
                .flat_map(|g| g.member_observation_ids.clone())
                .collect();
            let total = seen.len();
            seen.sort();
            seen.dedup();
            prop_assert_eq!(seen.len(), total);
        }
    }
}
