use crate::score::probability_range;
use std::cmp::Reverse;
use tipwire_core::{ConsensusGroup, ResultSet, Score, Tip, TBD};

pub const PICK_OF_DAY_EXPLANATION: &str =
    "Pick of the day: strongest cross-source consensus and form signals in today's tips";

/// Static anomaly flags, independent of scraped data.
struct AnomalyTemplate {
    horse: &'static str,
    ai_score: u8,
    explanation: &'static str,
}

const ANOMALY_CATALOG: &[AnomalyTemplate] = &[
    AnomalyTemplate {
        horse: "Trainer single runner",
        ai_score: 70,
        explanation: "Trainer has sent a single runner to the meeting; a targeted entry is worth a look",
    },
    AnomalyTemplate {
        horse: "First-time headgear",
        ai_score: 65,
        explanation: "Runner wears headgear for the first time; sharp improvement is common",
    },
    AnomalyTemplate {
        horse: "Shorter than expected odds",
        ai_score: 75,
        explanation: "Price is shorter than recent form suggests; the market knows something",
    },
    AnomalyTemplate {
        horse: "Class drop",
        ai_score: 68,
        explanation: "Runner drops in class after competing at a higher level",
    },
];

pub fn anomaly_tips() -> Vec<Tip> {
    ANOMALY_CATALOG
        .iter()
        .map(|a| {
            let (lo, hi) = probability_range(a.ai_score);
            Tip {
                horse: a.horse.to_string(),
                track: TBD.to_string(),
                time: TBD.to_string(),
                odds: TBD.to_string(),
                ai_score: a.ai_score,
                probability: format!("{lo}-{hi}%"),
                explanation: a.explanation.to_string(),
                highlighted: true,
            }
        })
        .collect()
}

/// Score-descending order; ties keep encounter order (stable sort).
pub fn rank(scored: &[(ConsensusGroup, Score)]) -> Vec<Tip> {
    let mut tips: Vec<Tip> = scored
        .iter()
        .map(|(g, s)| Tip::from_scored(g, s))
        .collect();
    tips.sort_by_key(|t| Reverse(t.ai_score));
    tips
}

/// Build the bucketed result set. Every bucket holds at most `bucket_cap` tips and
/// `pick_of_day` at most one. With no scored groups only `anomalies` is populated.
pub fn assemble(scored: &[(ConsensusGroup, Score)], bucket_cap: usize) -> ResultSet {
    let mut ranked = rank(scored);
    ranked.truncate(bucket_cap);

    let pick_of_day = ranked
        .first()
        .cloned()
        .map(|mut t| {
            t.highlighted = true;
            t.explanation = PICK_OF_DAY_EXPLANATION.to_string();
            t
        })
        .into_iter()
        .collect();

    let mut anomalies = anomaly_tips();
    anomalies.truncate(bucket_cap);

    ResultSet {
        pick_of_day,
        today_best: ranked.clone(),
        // No independent tomorrow extraction yet; mirrors today.
        tomorrow_best: ranked.clone(),
        look_at_these: ranked,
        anomalies,
    }
}
