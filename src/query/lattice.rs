//! Posting-scan top-k engine with a source lattice (C9, NRA mode)
//!
//! Drives retrieval by scanning the tree-level posting streams of the
//! query terms in parallel instead of descending the tree. Used for
//! few-term queries over large collections.
//!
//! Candidates are keyed by item id and carry a bitmap of the streams they
//! have been seen in; their spatial score is exact from the first sighting
//! (the item's point is a directory lookup), while the text part is the
//! sum of observed contributions plus, for unseen streams, the stream's
//! current head impact. Impacts are non-increasing along every stream, so
//! a candidate's upper bound only decreases between refreshes and the
//! k-th score only increases, which guarantees termination.
//!
//! For every non-empty source bitmap a leader (highest-bound candidate of
//! that cell) is cached. A cell dries out when none of its candidates can
//! beat the k-th score; a source becomes irrelevant once every cell
//! excluding it has dried, every admitted result covers it (results only
//! admit fully-seen candidates, so they always do), and a never-seen item
//! could no longer beat the k-th score. Irrelevant sources stop being
//! advanced; the search ends when every source is exhausted or
//! irrelevant.

use crate::index::{InvertedFile, Posting, PostingStream, TREE_LEVEL_NODE};
use crate::query::{
    step_allowed, PreparedQuery, RankedItem, SearchOptions, SearchOutcome, TopKHeap,
};
use crate::stats::SharedStats;
use crate::types::Point;
use crate::{IndexError, Result};
use ahash::AHashMap;
use log::trace;

/// Upper limit on posting-scan sources; the leader array is 2^T cells.
pub(crate) const MAX_LATTICE_SOURCES: usize = 8;

/// Stream advances between unconditional candidate refreshes.
const FULL_UPDATE_INTERVAL: u64 = 64;

struct Source<'a> {
    stream: Option<PostingStream<'a>>,
    /// Next unconsumed posting; `None` once the stream is exhausted.
    head: Option<Posting>,
    weight: f64,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    seen: u8,
    text_seen: f64,
    spatial: f64,
}

/// Sum of head contributions of the streams not yet seen by `seen`.
fn unseen_bound(sources: &[Source<'_>], seen: u8) -> f64 {
    sources
        .iter()
        .enumerate()
        .filter(|(s, source)| seen & (1 << s) == 0 && source.head.is_some())
        .map(|(_, source)| source.weight * source.head.as_ref().unwrap().impact as f64)
        .sum()
}

fn candidate_ub(query: &PreparedQuery, sources: &[Source<'_>], candidate: &Candidate) -> f64 {
    let text = (candidate.text_seen + unseen_bound(sources, candidate.seen)).min(1.0);
    query.combined(candidate.spatial, text)
}

/// Bound on an item never seen in any stream: best possible proximity
/// plus every live head.
fn fresh_candidate_bound(query: &PreparedQuery, sources: &[Source<'_>]) -> f64 {
    query.combined(1.0, unseen_bound(sources, 0).min(1.0))
}

pub(crate) fn search(
    inverted: &InvertedFile,
    query: &PreparedQuery,
    options: &SearchOptions,
    point_of: &dyn Fn(u32) -> Option<Point>,
    stats: &SharedStats,
) -> Result<SearchOutcome> {
    let source_count = query.terms.len();
    debug_assert!((1..=MAX_LATTICE_SOURCES).contains(&source_count));
    let cells = 1usize << source_count;
    let full_mask: u8 = (cells - 1) as u8;

    let mut sources: Vec<Source<'_>> = Vec::with_capacity(source_count);
    for qt in &query.terms {
        let mut stream = inverted.stream(TREE_LEVEL_NODE, qt.term)?;
        let head = match stream.as_mut() {
            Some(s) => s.next()?,
            None => None,
        };
        sources.push(Source {
            stream,
            head,
            weight: qt.weight,
        });
    }

    let mut candidates: AHashMap<u32, Candidate> = AHashMap::new();
    let mut leaders: Vec<Option<(u32, f64)>> = vec![None; cells];
    // dried[b]: cell b holds no candidate that could still matter; never
    // stale-true because arrivals clear it immediately
    let mut dried: Vec<bool> = vec![true; cells];
    let mut irrelevant: u8 = 0;
    let mut results = TopKHeap::new(query.k);
    let mut steps = 0u64;
    let mut partial = false;
    let mut round_robin = 0usize;
    let mut delta_since_refresh = 0.0f64;
    let mut max_leader_ub = f64::INFINITY;

    loop {
        let next = (0..source_count)
            .map(|offset| (round_robin + offset) % source_count)
            .find(|s| sources[*s].head.is_some() && irrelevant & (1 << s) == 0);
        let Some(s) = next else {
            break;
        };
        round_robin = (s + 1) % source_count;

        if !step_allowed(options, steps)? {
            partial = true;
            break;
        }
        steps += 1;

        let posting = sources[s].head.take().expect("source was active");
        sources[s].head = match sources[s].stream.as_mut() {
            Some(stream) => stream.next()?,
            None => None,
        };
        let new_impact = sources[s].head.map_or(0.0, |p| p.impact as f64);
        delta_since_refresh += sources[s].weight * (posting.impact as f64 - new_impact);

        // sight or refine the candidate
        if !candidates.contains_key(&posting.id) {
            let point = point_of(posting.id).ok_or_else(|| {
                IndexError::Corrupt(format!("item {} has no stored location", posting.id))
            })?;
            candidates.insert(
                posting.id,
                Candidate {
                    seen: 0,
                    text_seen: 0.0,
                    spatial: query.spatial_score(&point),
                },
            );
        }
        let candidate = candidates.get_mut(&posting.id).expect("just inserted");
        candidate.seen |= 1 << s;
        candidate.text_seen += sources[s].weight * posting.impact as f64;

        if candidate.seen == full_mask {
            let done = candidates.remove(&posting.id).expect("present");
            results.push(RankedItem {
                score: query.combined(done.spatial, done.text_seen.min(1.0)),
                item: posting.id,
            });
        } else {
            let ub = candidate_ub(query, &sources, candidate);
            let cell = candidate.seen as usize;
            dried[cell] = false;
            let slot = &mut leaders[cell];
            if slot.map_or(true, |(_, best)| ub > best) {
                *slot = Some((posting.id, ub));
            }
        }

        // light rule: the cached leader bounds have decayed by at most the
        // accumulated head deltas; once that slack reaches the k-th score
        // it is time to tighten
        let light_due = results.is_full()
            && max_leader_ub - delta_since_refresh <= results.threshold();
        let full_due = steps % FULL_UPDATE_INTERVAL == 0;
        if light_due || full_due {
            refresh_lattice(
                query,
                &sources,
                &mut candidates,
                &mut leaders,
                &mut dried,
                &mut results,
                full_due,
                stats,
            );
            max_leader_ub = leaders
                .iter()
                .flatten()
                .map(|(_, ub)| *ub)
                .fold(f64::NEG_INFINITY, f64::max);
            if max_leader_ub == f64::NEG_INFINITY {
                // no cached leaders, nothing left to tighten
                max_leader_ub = f64::INFINITY;
            }
            delta_since_refresh = 0.0;
            mark_irrelevant_sources(
                query,
                &sources,
                &dried,
                &results,
                source_count,
                &mut irrelevant,
            );
        }
    }

    if !partial {
        // every non-irrelevant source is exhausted; a candidate covering
        // all irrelevant sources therefore has an exact score, and one
        // that does not was proven unable to beat the k-th score when its
        // sources were retired
        for (item, candidate) in candidates.drain() {
            if candidate.seen & irrelevant == irrelevant {
                results.push(RankedItem {
                    score: query.combined(candidate.spatial, candidate.text_seen.min(1.0)),
                    item,
                });
            }
        }
    }

    trace!(
        "posting-scan finished after {steps} advances, {} sources retired",
        irrelevant.count_ones()
    );
    Ok(SearchOutcome {
        hits: results.into_hits(),
        partial,
    })
}

/// Recompute candidate bounds from the current stream heads: finalize
/// candidates whose unseen streams are exhausted (full update only),
/// discard candidates that can no longer beat the k-th score, and rebuild
/// the leader array and the dried cells.
#[allow(clippy::too_many_arguments)]
fn refresh_lattice(
    query: &PreparedQuery,
    sources: &[Source<'_>],
    candidates: &mut AHashMap<u32, Candidate>,
    leaders: &mut [Option<(u32, f64)>],
    dried: &mut [bool],
    results: &mut TopKHeap,
    finalize: bool,
    stats: &SharedStats,
) {
    if finalize {
        stats.record(|c| c.lattice_full_updates += 1);
        let exact: Vec<u32> = candidates
            .iter()
            .filter(|(_, c)| {
                sources
                    .iter()
                    .enumerate()
                    .all(|(s, source)| c.seen & (1 << s) != 0 || source.head.is_none())
            })
            .map(|(id, _)| *id)
            .collect();
        for id in exact {
            let candidate = candidates.remove(&id).expect("collected above");
            results.push(RankedItem {
                score: query.combined(candidate.spatial, candidate.text_seen.min(1.0)),
                item: id,
            });
        }
    }

    let kth = results.threshold();
    let prune = results.is_full();
    leaders.iter_mut().for_each(|slot| *slot = None);
    candidates.retain(|id, candidate| {
        let ub = candidate_ub(query, sources, candidate);
        if prune && ub < kth {
            return false;
        }
        let slot = &mut leaders[candidate.seen as usize];
        if slot.map_or(true, |(_, best)| ub > best) {
            *slot = Some((*id, ub));
        }
        true
    });
    for (cell, slot) in leaders.iter().enumerate() {
        dried[cell] = slot.is_none();
    }
}

/// A source can be retired once no surviving candidate lacks it (every
/// cell excluding it has dried), every admitted result covers it (always
/// true: only fully-seen candidates are admitted), and a brand-new item
/// could no longer beat the k-th score.
fn mark_irrelevant_sources(
    query: &PreparedQuery,
    sources: &[Source<'_>],
    dried: &[bool],
    results: &TopKHeap,
    source_count: usize,
    irrelevant: &mut u8,
) {
    if !results.is_full() {
        return;
    }
    if fresh_candidate_bound(query, sources) >= results.threshold() {
        return;
    }
    for s in 0..source_count {
        let bit = 1u8 << s;
        if *irrelevant & bit != 0 || sources[s].head.is_none() {
            continue;
        }
        let all_excluding_dried = (1..dried.len())
            .filter(|b| *b as u8 & bit == 0)
            .all(|b| dried[b]);
        if all_excluding_dried {
            trace!("source {s} retired");
            *irrelevant |= bit;
        }
    }
}
