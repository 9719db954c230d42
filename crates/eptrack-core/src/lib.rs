//! Core domain model and arc assignment for eptrack.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "eptrack-core";

/// Name of the sentinel arc that receives episodes outside every defined range.
pub const UNKNOWN_ARC_NAME: &str = "Unknown Arc";

/// Normalized handoff contract from source adapters into the sync pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeDraft {
    pub number: i32,
    pub title: String,
    pub air_date: Option<NaiveDate>,
}

/// Episode row as persisted; `arc_id` is assigned by the resolver at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub id: i32,
    pub title: String,
    pub air_date: Option<NaiveDate>,
    pub arc_id: i32,
}

impl Episode {
    pub fn from_draft(draft: EpisodeDraft, arc_id: i32) -> Self {
        Self {
            id: draft.number,
            title: draft.title,
            air_date: draft.air_date,
            arc_id,
        }
    }
}

/// Story arc reference row. Bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryArc {
    pub id: i32,
    pub name: String,
    pub start_episode: i32,
    pub end_episode: i32,
    #[serde(default)]
    pub description: Option<String>,
}

impl StoryArc {
    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN_ARC_NAME
    }

    pub fn contains(&self, episode_number: i32) -> bool {
        self.start_episode <= episode_number && episode_number <= self.end_episode
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArcTableError {
    #[error("arc set has no \"Unknown Arc\" row and no fallback arc id is configured")]
    MissingUnknownArc,
}

/// Range lookup over the arc set, built once per sync run.
///
/// Ranged arcs are kept in ascending `(start_episode, id)` order and the first covering
/// range wins, so improperly overlapping ranges resolve to the earliest-starting arc.
/// Episodes covered by no range resolve to the fallback id: the "Unknown Arc" row when the
/// set has one (lowest id if several), otherwise the configured fallback constant.
#[derive(Debug, Clone)]
pub struct ArcTable {
    ranges: Vec<StoryArc>,
    fallback_id: i32,
}

impl ArcTable {
    pub fn new(
        arcs: impl IntoIterator<Item = StoryArc>,
        configured_fallback: Option<i32>,
    ) -> Result<Self, ArcTableError> {
        let mut ranges = Vec::new();
        let mut unknown_id: Option<i32> = None;
        for arc in arcs {
            if arc.is_unknown() {
                unknown_id = Some(unknown_id.map_or(arc.id, |id| id.min(arc.id)));
            } else {
                ranges.push(arc);
            }
        }
        ranges.sort_by_key(|arc| (arc.start_episode, arc.id));

        let fallback_id = unknown_id
            .or(configured_fallback)
            .ok_or(ArcTableError::MissingUnknownArc)?;

        Ok(Self {
            ranges,
            fallback_id,
        })
    }

    pub fn resolve(&self, episode_number: i32) -> i32 {
        self.matching_arc(episode_number)
            .map_or(self.fallback_id, |arc| arc.id)
    }

    pub fn matching_arc(&self, episode_number: i32) -> Option<&StoryArc> {
        self.ranges.iter().find(|arc| arc.contains(episode_number))
    }

    pub fn fallback_id(&self) -> i32 {
        self.fallback_id
    }

    /// Number of ranged arcs, not counting the fallback.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// One-shot form of [`ArcTable::resolve`] for callers holding a plain arc slice.
pub fn resolve_arc(episode_number: i32, arcs: &[StoryArc]) -> Result<i32, ArcTableError> {
    Ok(ArcTable::new(arcs.iter().cloned(), None)?.resolve(episode_number))
}
