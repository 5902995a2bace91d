use std::collections::{BTreeSet, HashMap};
use tipwire_core::{Candidate, ConsensusGroup, UNKNOWN_HORSE};

fn fill(slot: &mut Option<String>, from: &Option<String>) {
    if slot.is_none() {
        slot.clone_from(from);
    }
}

/// Group candidates that name the same horse, across all sources.
///
/// - Groups come out in first-seen order (not sorted by count).
/// - `mention_count` counts distinct sources; a source mentioning a horse twice counts once.
/// - The representative is the first member; later members only fill its empty
///   `odds`/`track`/`time` (first non-null wins per field).
/// - Placeholder names carry no identity, so each such candidate stays in a group of its own.
pub fn aggregate(candidates: &[Candidate]) -> Vec<ConsensusGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<ConsensusGroup> = Vec::new();
    let mut sources: Vec<BTreeSet<String>> = Vec::new();

    for c in candidates {
        let key = c.key();
        if key.is_empty() {
            continue;
        }
        let placeholder = c.horse_name == UNKNOWN_HORSE;
        match index.get(&key).filter(|_| !placeholder) {
            Some(&i) => {
                let g = &mut groups[i];
                fill(&mut g.representative.odds, &c.odds);
                fill(&mut g.representative.track, &c.track);
                fill(&mut g.representative.time, &c.time);
                g.members.push(c.clone());
                sources[i].insert(c.source_id.clone());
                g.mention_count = sources[i].len();
            }
            None => {
                if !placeholder {
                    index.insert(key.clone(), groups.len());
                }
                sources.push(BTreeSet::from([c.source_id.clone()]));
                groups.push(ConsensusGroup {
                    key,
                    members: vec![c.clone()],
                    representative: c.clone(),
                    mention_count: 1,
                });
            }
        }
    }
    groups
}
