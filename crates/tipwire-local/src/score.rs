use tipwire_core::{ConsensusGroup, Score, ScoringConfig};

const MAX_DESCRIPTION_CHARS: usize = 120;

pub const PROBABILITY_FLOOR: u8 = 40;
pub const PROBABILITY_CEILING: u8 = 90;

fn has_flag_keyword(snippet: &str, cfg: &ScoringConfig) -> bool {
    let lc = snippet.to_lowercase();
    cfg.flag_keywords
        .iter()
        .any(|k| !k.is_empty() && lc.contains(&k.to_lowercase()))
}

/// `clamp(base + mention_count * consensus_weight + anomaly_bonus, 0, 100)`.
pub fn ai_score(mention_count: usize, anomaly: bool, cfg: &ScoringConfig) -> u8 {
    let mentions = i64::try_from(mention_count).unwrap_or(i64::MAX);
    let bonus = if anomaly { cfg.anomaly_bonus } else { 0 };
    let raw = cfg
        .base
        .saturating_add(mentions.saturating_mul(cfg.consensus_weight))
        .saturating_add(bonus);
    raw.clamp(0, 100) as u8
}

/// `"{lo}-{hi}%"` with `lo = max(40, score - 30)` and `hi = min(90, score)`.
///
/// Scores under the floor would invert the range; `hi` is raised to `lo` in that case.
pub fn probability_range(ai_score: u8) -> (u8, u8) {
    let lo = ai_score.saturating_sub(30).max(PROBABILITY_FLOOR);
    let hi = ai_score.min(PROBABILITY_CEILING).max(lo);
    (lo, hi)
}

fn describe(group: &ConsensusGroup) -> String {
    let snippet = group
        .representative
        .raw_snippet
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let base = if snippet.is_empty() {
        group.representative.horse_name.clone()
    } else {
        snippet
    };
    let mut out: String = base.chars().take(MAX_DESCRIPTION_CHARS).collect();
    if base.chars().count() > MAX_DESCRIPTION_CHARS {
        out.push_str("...");
    }
    out
}

/// Score one consensus group. Pure: the same group and config always give the same score.
pub fn score(group: &ConsensusGroup, cfg: &ScoringConfig) -> Score {
    let anomaly = has_flag_keyword(&group.representative.raw_snippet, cfg);
    let ai_score = ai_score(group.mention_count, anomaly, cfg);
    let (lo, hi) = probability_range(ai_score);
    Score {
        ai_score,
        probability: format!("{lo}-{hi}%"),
        explanation: format!(
            "{} | {} sources agree + form/anomaly signals",
            describe(group),
            group.mention_count
        ),
        anomaly,
    }
}
