//! Sequence construction.
//!
//! Geotagged images are grouped into streams (one per directory unless
//! subfolders are ignored), each stream is ordered by capture time and cut
//! wherever consecutive images are too far apart in space or time. Missing
//! headings are interpolated along the track and every run is chunked into
//! sequences of bounded size, each under a fresh identifier.

use crate::config::SequenceConfig;
use crate::description::{GeotagRecord, ImageDescription, SequenceRecord};
use crate::geodesy;
use crate::point::{GeoPoint, Located};
use crate::point_stream::{divide_if, generate_pairs};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Hard upper bound on images per sequence
pub const MAX_SEQUENCE_LENGTH: usize = 250;

/// Source tag written into every sequenced image
pub fn default_source_tag() -> String {
    format!("capture-kit-v{}", env!("CARGO_PKG_VERSION"))
}

/// Split an ordered stream wherever `cutoff_distance <= distance` or
/// `cutoff_time <= elapsed` between consecutive points.
pub fn split_sequences<P>(points: &[P], cutoff_distance: f64, cutoff_time: f64) -> Vec<Vec<P>>
where
    P: Located + Clone,
{
    divide_if(points, |prev, cur| breaks_sequence(prev, cur, cutoff_distance, cutoff_time))
}

fn breaks_sequence<P: Located>(prev: &P, cur: &P, cutoff_distance: f64, cutoff_time: f64) -> bool {
    let distance = geodesy::distance_lat_lon(prev.lat(), prev.lon(), cur.lat(), cur.lon());
    cutoff_distance <= distance || cutoff_time <= cur.time() - prev.time()
}

/// Headings for a contiguous run of points.
///
/// A point gets the bearing to its successor when `interpolate` is set or
/// it has no heading of its own. The last point takes the heading assigned
/// to the one before it under the same condition. Runs shorter than two
/// points are returned unchanged.
pub fn interpolate_headings(points: &[GeoPoint], interpolate: bool) -> Vec<Option<f64>> {
    if points.len() < 2 {
        return points.iter().map(|p| p.heading).collect();
    }

    let mut headings: Vec<Option<f64>> = generate_pairs(points)
        .map(|(cur, next)| {
            if interpolate || cur.heading.is_none() {
                Some(geodesy::bearing(cur, next))
            } else {
                cur.heading
            }
        })
        .collect();

    let last = &points[points.len() - 1];
    let last_heading = if interpolate || last.heading.is_none() {
        headings.last().copied().flatten()
    } else {
        last.heading
    };
    headings.push(last_heading);

    headings
}

/// Assigns sequence identifiers, headings and the source tag to images.
#[derive(Debug, Clone)]
pub struct SequenceBuilder {
    config: SequenceConfig,
    source: String,
}

impl SequenceBuilder {
    pub fn new(config: SequenceConfig) -> Self {
        Self {
            config,
            source: default_source_tag(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    fn chunk_length(&self) -> usize {
        self.config.max_sequence_length.clamp(1, MAX_SEQUENCE_LENGTH)
    }

    /// Build the sequence stage record of every geotagged image.
    ///
    /// The result is aligned with `geotags`.
    pub fn build(&self, geotags: &[GeotagRecord]) -> Vec<SequenceRecord> {
        let mut records = vec![SequenceRecord::default(); geotags.len()];

        let mut streams: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (idx, geotag) in geotags.iter().enumerate() {
            let key = if self.config.skip_subfolders {
                ""
            } else {
                geotag.path.as_str()
            };
            streams.entry(key).or_default().push(idx);
        }

        let mut sequence_count = 0;
        for (directory, mut indices) in streams {
            // stable, so equal capture times keep input order
            indices.sort_by(|a, b| geotags[*a].capture_time.cmp(&geotags[*b].capture_time));

            let runs = divide_if(&indices, |prev, cur| {
                breaks_sequence(
                    &geotags[*prev],
                    &geotags[*cur],
                    self.config.cutoff_distance_m,
                    self.config.cutoff_time_secs,
                )
            });
            debug!(
                directory = %directory,
                images = indices.len(),
                runs = runs.len(),
                "Split image stream"
            );

            for run in runs {
                let points: Vec<GeoPoint> = run
                    .iter()
                    .map(|idx| {
                        let geotag = &geotags[*idx];
                        GeoPoint {
                            time: geotag.time(),
                            lat: geotag.latitude,
                            lon: geotag.longitude,
                            altitude: geotag.altitude,
                            heading: geotag.heading,
                        }
                    })
                    .collect();
                let headings = interpolate_headings(&points, self.config.interpolate_directions);

                for (chunk, chunk_headings) in run
                    .chunks(self.chunk_length())
                    .zip(headings.chunks(self.chunk_length()))
                {
                    let sequence_uuid = Uuid::new_v4().to_string();
                    sequence_count += 1;

                    for (idx, heading) in chunk.iter().zip(chunk_headings) {
                        records[*idx] = SequenceRecord {
                            sequence_uuid: Some(sequence_uuid.clone()),
                            heading: *heading,
                            source: Some(self.source.clone()),
                        };
                    }
                }
            }
        }

        info!(
            images = geotags.len(),
            sequences = sequence_count,
            "Built sequences"
        );
        records
    }
}

/// Images that share one sequence identifier
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    pub uuid: String,
    pub images: Vec<ImageDescription>,
}

/// Group images by `sequenceUuid`, in order of first appearance.
///
/// Images without an identifier are gathered under one fresh identifier.
pub fn group_by_sequence(images: Vec<ImageDescription>) -> Vec<Sequence> {
    let mut fallback_uuid: Option<String> = None;
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<ImageDescription>> = BTreeMap::new();

    for image in images {
        let uuid = match &image.sequence_uuid {
            Some(uuid) => uuid.clone(),
            None => fallback_uuid
                .get_or_insert_with(|| Uuid::new_v4().to_string())
                .clone(),
        };
        if !groups.contains_key(&uuid) {
            order.push(uuid.clone());
        }
        groups.entry(uuid).or_default().push(image);
    }

    order
        .into_iter()
        .filter_map(|uuid| groups.remove(&uuid).map(|images| Sequence { uuid, images }))
        .collect()
}
