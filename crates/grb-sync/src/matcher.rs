//! Scores search-index candidates against a grab event.

use grb_core::{normalize_indexer, Candidate};
use serde::Serialize;
use tracing::debug;

pub const TITLE_EXACT_POINTS: i32 = 2;
pub const TITLE_CONTAINS_POINTS: i32 = 1;
pub const INDEXER_POINTS: i32 = 1;
pub const HASH_POINTS: i32 = 3;
pub const SIZE_POINTS: i32 = 1;

const SIZE_TOLERANCE_RATIO: f64 = 0.02;
const SIZE_TOLERANCE_FLOOR: i64 = 5 * 1024 * 1024;

/// What is known about the grabbed release.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchQuery<'a> {
    pub title: &'a str,
    pub download_id: Option<&'a str>,
    pub indexer: Option<&'a str>,
    pub size: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    pub score: i32,
    /// Index in the upstream result order.
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Accepted(ScoredCandidate),
    BelowThreshold(ScoredCandidate),
    NoCandidates,
}

pub fn score_candidate(query: &MatchQuery<'_>, candidate: &Candidate) -> i32 {
    let mut score = 0;

    let release_title = query.title.trim().to_lowercase();
    let candidate_title = candidate.title.as_deref().unwrap_or("").to_lowercase();
    if !release_title.is_empty() {
        if candidate_title == release_title {
            score += TITLE_EXACT_POINTS;
        } else if candidate_title.contains(&release_title) {
            score += TITLE_CONTAINS_POINTS;
        }
    }

    if let Some(indexer) = query.indexer.filter(|i| !i.trim().is_empty()) {
        if normalize_indexer(indexer) == normalize_indexer(candidate.indexer.as_deref().unwrap_or("")) {
            score += INDEXER_POINTS;
        }
    }

    if let (Some(expected), Some(hash)) = (
        query.download_id.map(str::trim).filter(|d| !d.is_empty()),
        candidate.content_hash(),
    ) {
        if hash.eq_ignore_ascii_case(expected) {
            score += HASH_POINTS;
        }
    }

    if size_matches(candidate.size, query.size) {
        score += SIZE_POINTS;
    }

    score
}

/// Within `max(2% of expected, 5 MiB)`; zero or missing sizes never match.
pub fn size_matches(candidate: Option<i64>, expected: Option<i64>) -> bool {
    match (candidate, expected) {
        (Some(candidate), Some(expected)) if candidate != 0 && expected != 0 => {
            let tolerance = ((expected as f64 * SIZE_TOLERANCE_RATIO) as i64).max(SIZE_TOLERANCE_FLOOR);
            (candidate - expected).abs() <= tolerance
        }
        _ => false,
    }
}

/// Highest score first; equal scores keep upstream order.
pub fn rank_candidates(query: &MatchQuery<'_>, candidates: Vec<Candidate>) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .into_iter()
        .enumerate()
        .map(|(position, candidate)| ScoredCandidate {
            score: score_candidate(query, &candidate),
            candidate,
            position,
        })
        .collect();
    scored.sort_by(|a, b| b.score.cmp(&a.score));
    scored
}

pub fn select_candidate(
    query: &MatchQuery<'_>,
    candidates: Vec<Candidate>,
    min_score: i32,
) -> MatchDecision {
    let ranked = rank_candidates(query, candidates);
    let tied = ranked
        .get(1)
        .zip(ranked.first())
        .is_some_and(|(second, first)| second.score == first.score);
    let Some(best) = ranked.into_iter().next() else {
        return MatchDecision::NoCandidates;
    };
    if tied {
        debug!(
            score = best.score,
            position = best.position,
            "top candidate score is tied; keeping the earliest upstream result"
        );
    }
    if best.score >= min_score {
        MatchDecision::Accepted(best)
    } else {
        MatchDecision::BelowThreshold(best)
    }
}
