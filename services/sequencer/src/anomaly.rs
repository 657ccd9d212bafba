//! Plausibility checks over finished descriptions.
//!
//! Every sequence is checked on its own: invalid coordinates and fixes above
//! the altitude ceiling are rejected, duplicates of the previous kept image
//! are dropped, the sequence is cut at implausible jumps with only its
//! dominant run kept, and sudden heading flips are rejected.

use crate::config::AnomalyConfig;
use crate::description::{FailedEntry, ImageDescription, ImageFailure, Summary};
use crate::geodesy;
use crate::point_stream::divide_if;
use crate::sequence_builder::group_by_sequence;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Why an image was rejected
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnomalyReason {
    #[error("coordinates ({latitude}, {longitude}) are not a valid position")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("altitude {altitude:.1} m above ceiling {ceiling:.1} m")]
    AltitudeCeiling { altitude: f64, ceiling: f64 },

    #[error("GPS distance {distance:.1} m out of range (limit {limit:.1} m)")]
    DistanceOutOfRange { distance: f64, limit: f64 },

    #[error("heading changed by {delta:.1} degrees (limit {limit:.1})")]
    HeadingLimit { delta: f64, limit: f64 },
}

/// A rejected image and where it was
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnomalyPoint {
    pub id: String,
    pub path: String,
    pub filename: String,
    pub latitude: f64,
    pub longitude: f64,
    pub capture_time: String,
    pub reason: AnomalyReason,
}

impl AnomalyPoint {
    pub fn to_entry(&self) -> FailedEntry {
        FailedEntry {
            path: self.path.clone(),
            filename: self.filename.clone(),
            error: serde_json::json!({
                "type": "AnomalyError",
                "message": self.reason.to_string(),
                "vars": { "reason": &self.reason, "id": &self.id },
            }),
        }
    }
}

/// Outcome of anomaly detection
#[derive(Debug, Clone)]
pub struct AnomalyReport {
    /// Accepted descriptions, marked `anomaly: 0`
    pub descriptions: Vec<ImageDescription>,
    /// Identifiers of every image that was not accepted
    pub failed_images: Vec<String>,
    pub anomaly_points: Vec<AnomalyPoint>,
    pub duplicates: Vec<ImageFailure>,
    /// Aggregate counts including this pass
    pub summary: Summary,
}

fn image_id(image: &ImageDescription) -> String {
    image
        .photo_uuid
        .clone()
        .unwrap_or_else(|| image.relative_path().display().to_string())
}

fn distance(a: &ImageDescription, b: &ImageDescription) -> f64 {
    geodesy::distance_lat_lon(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// Flags anomalous and duplicate images.
#[derive(Debug, Clone)]
pub struct AnomalyFilter {
    config: AnomalyConfig,
}

impl AnomalyFilter {
    pub fn new(config: AnomalyConfig) -> Self {
        Self { config }
    }

    fn check_position(&self, image: &ImageDescription) -> Option<AnomalyReason> {
        let (lat, lon) = (image.latitude, image.longitude);
        let valid = lat.is_finite()
            && lon.is_finite()
            && (-90.0..=90.0).contains(&lat)
            && (-180.0..=180.0).contains(&lon)
            && !(lat == 0.0 && lon == 0.0);
        if !valid {
            return Some(AnomalyReason::InvalidCoordinates {
                latitude: lat,
                longitude: lon,
            });
        }

        match image.altitude {
            Some(altitude) if altitude > self.config.altitude_ceiling_m => {
                Some(AnomalyReason::AltitudeCeiling {
                    altitude,
                    ceiling: self.config.altitude_ceiling_m,
                })
            }
            _ => None,
        }
    }

    /// Check one sequence, ordered by capture time.
    fn check_sequence(
        &self,
        mut images: Vec<ImageDescription>,
        report: &mut AnomalyReport,
        rejected: &mut Vec<(ImageDescription, AnomalyReason)>,
    ) {
        images.sort_by(|a, b| a.capture_time.cmp(&b.capture_time));

        let mut positioned = Vec::with_capacity(images.len());
        for image in images {
            match self.check_position(&image) {
                Some(reason) => rejected.push((image, reason)),
                None => positioned.push(image),
            }
        }

        let mut deduplicated: Vec<ImageDescription> = Vec::with_capacity(positioned.len());
        for image in positioned {
            match deduplicated.last() {
                Some(prev) if distance(prev, &image) <= self.config.duplicate_distance_m => {
                    let distance = distance(prev, &image);
                    report.duplicates.push(ImageFailure::Duplication {
                        description: Box::new(image),
                        distance,
                    });
                }
                _ => deduplicated.push(image),
            }
        }

        let limit = self.config.max_jump_distance_m;
        let runs = divide_if(&deduplicated, |prev, cur| distance(prev, cur) > limit);
        let dominant_idx = runs
            .iter()
            .enumerate()
            .fold(None::<(usize, usize)>, |best, (idx, run)| match best {
                Some((_, len)) if len >= run.len() => best,
                _ => Some((idx, run.len())),
            })
            .map(|(idx, _)| idx);

        // jump into each run, the first run takes the jump out of it
        let breaks: Vec<f64> = runs
            .windows(2)
            .filter_map(|pair| Some(distance(pair[0].last()?, pair[1].first()?)))
            .collect();

        let mut kept: Vec<ImageDescription> = Vec::new();
        for (idx, run) in runs.into_iter().enumerate() {
            if Some(idx) == dominant_idx {
                kept = run;
                continue;
            }
            let jump = breaks.get(idx.saturating_sub(1)).copied().unwrap_or(0.0);
            for image in run {
                rejected.push((image, AnomalyReason::DistanceOutOfRange { distance: jump, limit }));
            }
        }

        let mut last_heading: Option<f64> = None;
        for mut image in kept {
            if let (Some(prev), Some(cur)) = (last_heading, image.heading) {
                let delta = geodesy::bearing_difference(prev, cur);
                if delta > self.config.max_heading_delta_deg {
                    rejected.push((
                        image,
                        AnomalyReason::HeadingLimit {
                            delta,
                            limit: self.config.max_heading_delta_deg,
                        },
                    ));
                    continue;
                }
            }
            last_heading = image.heading.or(last_heading);
            image.anomaly = Some(0);
            report.descriptions.push(image);
        }
    }

    /// Filter descriptions and fold the results into the summary.
    ///
    /// Never fails; an empty `descriptions` list in the report means nothing
    /// is left to upload and the caller decides what that means.
    pub fn detect(&self, descriptions: Vec<ImageDescription>, information: Option<&Summary>) -> AnomalyReport {
        let total = descriptions.len();
        let base = information
            .cloned()
            .unwrap_or_else(|| Summary::new(total, 0, 0));

        let mut report = AnomalyReport {
            descriptions: Vec::with_capacity(total),
            failed_images: Vec::new(),
            anomaly_points: Vec::new(),
            duplicates: Vec::new(),
            summary: base.clone(),
        };
        let mut rejected: Vec<(ImageDescription, AnomalyReason)> = Vec::new();

        for sequence in group_by_sequence(descriptions) {
            debug!(sequence = %sequence.uuid, images = sequence.images.len(), "Checking sequence");
            self.check_sequence(sequence.images, &mut report, &mut rejected);
        }

        for (image, reason) in rejected {
            let id = image_id(&image);
            report.failed_images.push(id.clone());
            report.anomaly_points.push(AnomalyPoint {
                id,
                path: image.path.clone(),
                filename: image.filename.clone(),
                latitude: image.latitude,
                longitude: image.longitude,
                capture_time: image.capture_time_str(),
                reason,
            });
        }
        for duplicate in &report.duplicates {
            if let ImageFailure::Duplication { description, .. } = duplicate {
                report.failed_images.push(image_id(description));
            }
        }

        let newly_failed = report.anomaly_points.len() + report.duplicates.len();
        let total_images = base.total_images.max(total);
        let mut summary = Summary::new(
            total_images,
            base.failed_images + newly_failed,
            base.duplicated_images + report.duplicates.len(),
        );
        summary.id = base.id;
        summary.group_key = base.group_key;
        summary.device_type = base.device_type;
        summary.extra = base.extra;
        report.summary = summary;

        if !report.failed_images.is_empty() {
            warn!(
                count = report.failed_images.len(),
                failed = ?report.failed_images,
                "Some images failed anomaly detection: GPS distance out of range, heading limit exceeded or altitude above the ceiling"
            );
        }

        report
    }
}
