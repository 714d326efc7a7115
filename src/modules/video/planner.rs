//! Chooses which renditions a source is worth encoding into.

use super::model::Quality;
use crate::infrastructure::encoder::RenditionTarget;

/// Candidate renditions in ascending quality order.
pub const LADDER: [RenditionTarget; 3] = [
    RenditionTarget {
        quality: Quality::P480,
        width: 854,
        height: 480,
        bitrate_kbps: Some(1000),
    },
    RenditionTarget {
        quality: Quality::P720,
        width: 1280,
        height: 720,
        bitrate_kbps: Some(2500),
    },
    RenditionTarget {
        quality: Quality::P1080,
        width: 1920,
        height: 1080,
        bitrate_kbps: Some(4000),
    },
];

/// Default playback quality, most preferred first.
pub const PRIMARY_PREFERENCE: [Quality; 4] = [
    Quality::P720,
    Quality::P480,
    Quality::P1080,
    Quality::Original,
];

/// Every ladder rung whose height does not exceed the source's. A source below
/// the lowest rung gets a single pass at its own resolution instead, so every
/// plan holds at least one rendition.
pub fn plan(source_width: u32, source_height: u32) -> Vec<RenditionTarget> {
    let targets: Vec<RenditionTarget> = LADDER
        .iter()
        .filter(|rung| rung.height <= source_height)
        .copied()
        .collect();

    if !targets.is_empty() {
        return targets;
    }

    vec![RenditionTarget {
        quality: Quality::Original,
        width: source_width,
        height: source_height,
        bitrate_kbps: None,
    }]
}

pub fn primary_quality<'a, I>(available: I) -> Option<Quality>
where
    I: IntoIterator<Item = &'a Quality>,
{
    let available: Vec<Quality> = available.into_iter().copied().collect();
    PRIMARY_PREFERENCE
        .iter()
        .copied()
        .find(|q| available.contains(q))
}
