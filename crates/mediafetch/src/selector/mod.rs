//! Format selection.
//!
//! Turns a format expression and the streams of a media item into an ordered
//! list of [`FormatGroup`]s: the first group is the preferred download, the
//! rest are fallbacks tried by the coordinator when a group fails.
//!
//! Selection is a pure function of its inputs. Ties are broken by stream id,
//! so the input order of streams never influences the result.

mod filter;
mod parser;

pub use filter::{Condition, FilterKey, Op, Value};
pub use parser::{Alternative, Atom, Base, Expression, FilterGroup, parse, parse_number};

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::descriptor::{StreamDescriptor, TrackType};
use crate::error::EngineError;

/// Streams downloaded together and merged into one artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatGroup {
    members: Vec<Arc<StreamDescriptor>>,
}

impl FormatGroup {
    /// Build a group, rejecting combinations that cannot be merged.
    pub fn new(members: Vec<Arc<StreamDescriptor>>) -> Result<Self, EngineError> {
        let mut unique: Vec<Arc<StreamDescriptor>> = Vec::with_capacity(members.len());
        for member in members {
            if !unique.iter().any(|m| m.id == member.id) {
                unique.push(member);
            }
        }
        if unique.is_empty() {
            return Err(EngineError::AmbiguousMergeGroup {
                group: Vec::new(),
                reason: "empty group".to_string(),
            });
        }

        if unique.len() > 1 {
            let ids = || unique.iter().map(|m| m.id.clone()).collect::<Vec<_>>();
            if unique.iter().any(|m| m.track == TrackType::Combined) {
                return Err(EngineError::AmbiguousMergeGroup {
                    group: ids(),
                    reason: "a combined stream cannot be merged with other streams".to_string(),
                });
            }
            let video = unique.iter().filter(|m| m.track == TrackType::Video).count();
            let audio = unique.iter().filter(|m| m.track == TrackType::Audio).count();
            if video > 1 || audio > 1 {
                return Err(EngineError::AmbiguousMergeGroup {
                    group: ids(),
                    reason: format!("{video} video and {audio} audio streams"),
                });
            }
        }

        Ok(Self { members: unique })
    }

    pub fn single(descriptor: Arc<StreamDescriptor>) -> Self {
        Self {
            members: vec![descriptor],
        }
    }

    pub fn members(&self) -> &[Arc<StreamDescriptor>] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn requires_merge(&self) -> bool {
        self.members.len() > 1
    }

    pub fn ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.id.as_str()).collect()
    }

    pub fn video(&self) -> Option<&Arc<StreamDescriptor>> {
        self.members.iter().find(|m| m.track.has_video())
    }

    pub fn audio(&self) -> Option<&Arc<StreamDescriptor>> {
        self.members.iter().find(|m| m.track.has_audio())
    }
}

/// Compare two streams by quality: height, bitrate, then declared size.
/// Missing attributes rank lowest. The extractor preference hint (absent
/// counts as 0) only separates streams equal on all three.
pub fn compare_quality(a: &StreamDescriptor, b: &StreamDescriptor) -> Ordering {
    a.height
        .cmp(&b.height)
        .then_with(|| cmp_f64(a.bitrate(), b.bitrate()))
        .then_with(|| a.declared_size().cmp(&b.declared_size()))
        .then_with(|| a.preference.unwrap_or(0).cmp(&b.preference.unwrap_or(0)))
}

fn cmp_f64(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn best_of<'a>(
    candidates: impl Iterator<Item = &'a StreamDescriptor>,
) -> Option<&'a StreamDescriptor> {
    // Equal quality: the smaller id wins.
    candidates.max_by(|a, b| compare_quality(a, b).then_with(|| b.id.cmp(&a.id)))
}

fn worst_of<'a>(
    candidates: impl Iterator<Item = &'a StreamDescriptor>,
) -> Option<&'a StreamDescriptor> {
    candidates.min_by(|a, b| compare_quality(a, b).then_with(|| a.id.cmp(&b.id)))
}

/// Compiled format expression.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatSelector {
    expression: Expression,
}

impl FormatSelector {
    pub fn parse(expression: &str) -> Result<Self, EngineError> {
        Ok(Self {
            expression: parse(expression)?,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression.source
    }

    /// Resolve the expression against `streams`.
    ///
    /// Returns every satisfiable alternative in expression order, without
    /// duplicates. Fails with `NoMatchingFormat` when none is satisfiable.
    pub fn select(&self, streams: &[StreamDescriptor]) -> Result<Vec<FormatGroup>, EngineError> {
        let mut groups: Vec<FormatGroup> = Vec::new();
        let mut first_invalid: Option<EngineError> = None;

        for alternative in &self.expression.alternatives {
            let Some(members) = alternative
                .atoms
                .iter()
                .map(|atom| resolve_atom(atom, streams))
                .collect::<Option<Vec<_>>>()
            else {
                continue;
            };

            let members = members.into_iter().cloned().map(Arc::new).collect();
            match FormatGroup::new(members) {
                Ok(group) => {
                    if !groups.iter().any(|g| g.ids() == group.ids()) {
                        groups.push(group);
                    }
                }
                Err(e) => {
                    warn!(expression = %self.expression.source, error = %e, "Skipping unmergeable alternative");
                    first_invalid.get_or_insert(e);
                }
            }
        }

        if groups.is_empty() {
            return Err(first_invalid.unwrap_or_else(|| EngineError::NoMatchingFormat {
                expression: self.expression.source.clone(),
            }));
        }

        debug!(
            expression = %self.expression.source,
            selected = ?groups[0].ids(),
            fallbacks = groups.len() - 1,
            "Formats selected"
        );
        Ok(groups)
    }
}

/// One-shot helper: parse `expression` and select from `streams`.
pub fn select(expression: &str, streams: &[StreamDescriptor]) -> Result<Vec<FormatGroup>, EngineError> {
    FormatSelector::parse(expression)?.select(streams)
}

fn resolve_atom<'a>(atom: &Atom, streams: &'a [StreamDescriptor]) -> Option<&'a StreamDescriptor> {
    let filtered = || {
        streams
            .iter()
            .filter(move |s| filter::passes(&atom.filters, s))
    };
    let of_track = |track: TrackType| filtered().filter(move |s| s.track == track);

    match &atom.base {
        Base::Best => best_of(of_track(TrackType::Combined)).or_else(|| best_of(filtered())),
        Base::Worst => worst_of(of_track(TrackType::Combined)).or_else(|| worst_of(filtered())),
        Base::BestVideo => best_of(of_track(TrackType::Video)),
        Base::WorstVideo => worst_of(of_track(TrackType::Video)),
        Base::BestAudio => best_of(of_track(TrackType::Audio)),
        Base::WorstAudio => worst_of(of_track(TrackType::Audio)),
        Base::Named(name) => {
            if let Some(stream) = filtered().filter(|s| &s.id == name).min_by(|a, b| a.id.cmp(&b.id)) {
                return Some(stream);
            }
            // Not an id: treat the name as a container.
            let in_container = || filtered().filter(move |s| &s.container == name);
            best_of(in_container().filter(|s| s.track == TrackType::Combined))
                .or_else(|| best_of(in_container()))
        }
    }
}
