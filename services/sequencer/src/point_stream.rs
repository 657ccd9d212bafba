//! Stream processing over time-ordered points.
//!
//! These helpers work on any [`Located`] item so the same splitting and
//! clustering logic serves both image descriptions and raw telemetry tracks.
//!
//! The telemetry filters ([`cleanse_noisy_points`], [`purge_outliers`]) are
//! library entry points for callers that hold raw GPS tracks. The
//! `capture-sequence` binary works from description files, which carry no
//! fix or precision data, so it never calls them; `SequencerConfig::noise`
//! exists to configure them from the same config sources.

use crate::config::NoiseFilterConfig;
use crate::geodesy;
use crate::point::{Located, PointWithFix};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

/// Errors raised by the sample statistics helpers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatisticsError {
    #[error("at least {required} values are required for IQR, got {found}")]
    InsufficientSamples { required: usize, found: usize },
}

/// Consecutive pairs `(s0, s1), (s1, s2), ...`.
///
/// The iterator is cheap to clone, so it can be replayed; it yields nothing
/// for fewer than two items.
pub fn generate_pairs<T>(items: &[T]) -> impl Iterator<Item = (&T, &T)> + Clone {
    items.windows(2).map(|pair| (&pair[0], &pair[1]))
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Upper whisker `Q3 + 1.5 * IQR` of a sample. Values above it are outliers.
///
/// Quartiles are the medians of the lower and upper halves; for odd sample
/// sizes the median itself belongs to neither half.
pub fn calculate_upper_limit(values: &[f64]) -> Result<f64, StatisticsError> {
    let n = values.len();
    if n < 2 {
        return Err(StatisticsError::InsufficientSamples {
            required: 2,
            found: n,
        });
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let median_idx = n / 2;
    let q1 = median(&sorted[..median_idx]);
    let q3 = if n % 2 == 1 {
        median(&sorted[median_idx + 1..])
    } else {
        median(&sorted[median_idx..])
    };

    Ok(q3 + (q3 - q1) * 1.5)
}

/// Split `points` into contiguous runs, starting a new run whenever
/// `split(prev, cur)` holds.
pub fn divide_if<T, F>(points: &[T], mut split: F) -> Vec<Vec<T>>
where
    T: Clone,
    F: FnMut(&T, &T) -> bool,
{
    let mut runs: Vec<Vec<T>> = Vec::new();

    for (idx, point) in points.iter().enumerate() {
        match runs.last_mut() {
            Some(run) if !split(&points[idx - 1], point) => run.push(point.clone()),
            _ => runs.push(vec![point.clone()]),
        }
    }

    debug_assert_eq!(points.len(), runs.iter().map(Vec::len).sum::<usize>());
    runs
}

/// One-dimensional DBSCAN with `minPoints = 1`.
///
/// Each run is merged into the earliest later, still unassigned run whose
/// first point satisfies `merge(last point of this run, first point of that run)`.
/// Merged groups come back ordered by their first run.
pub fn cluster_merge<T, F>(runs: Vec<Vec<T>>, mut merge: F) -> Vec<Vec<T>>
where
    F: FnMut(&T, &T) -> bool,
{
    let mut merge_to: Vec<Option<usize>> = vec![None; runs.len()];

    for left in 0..runs.len() {
        let target = *merge_to[left].get_or_insert(left);

        let Some(left_last) = runs[left].last() else {
            continue;
        };

        for right in left + 1..runs.len() {
            if merge_to[right].is_some() {
                continue;
            }
            let Some(right_first) = runs[right].first() else {
                continue;
            };
            if merge(left_last, right_first) {
                merge_to[right] = Some(target);
                break;
            }
        }
    }

    let mut merged: BTreeMap<usize, Vec<T>> = BTreeMap::new();
    for (idx, run) in runs.into_iter().enumerate() {
        let target = merge_to[idx].unwrap_or(idx);
        merged.entry(target).or_default().extend(run);
    }

    merged.into_values().collect()
}

/// The longest group; ties go to the first one encountered.
pub fn find_dominant<T>(groups: Vec<Vec<T>>) -> Vec<T> {
    let mut dominant: Option<Vec<T>> = None;

    for group in groups {
        match &dominant {
            Some(current) if current.len() >= group.len() => {}
            _ => dominant = Some(group),
        }
    }

    dominant.unwrap_or_default()
}

/// Ground speed in m/s travelled from `p1` to `p2`.
pub fn estimate_ground_speed<P: Located>(p1: &P, p2: &P) -> f64 {
    let distance = geodesy::distance_lat_lon(p1.lat(), p1.lon(), p2.lat(), p2.lon());
    let elapsed = (p2.time() - p1.time()).abs();

    if elapsed == 0.0 {
        f64::INFINITY
    } else {
        distance / elapsed
    }
}

/// Keep the dominant contiguous run of a noisy track.
///
/// The track is split wherever consecutive points are farther apart than the
/// IQR distance whisker (never below twice the nominal GPS precision), runs are
/// merged back together when the speed across their junction is plausible,
/// and the largest resulting run is returned.
pub fn purge_outliers(sequence: &[PointWithFix], gps_precision_m: f64) -> Vec<PointWithFix> {
    let distances: Vec<f64> = generate_pairs(sequence)
        .map(|(left, right)| geodesy::distance(&left.point, &right.point))
        .collect();

    let Ok(upper_distance) = calculate_upper_limit(&distances) else {
        return sequence.to_vec();
    };
    debug!(max_distance = upper_distance, "Computed distance whisker");

    // distance between two points, hence double
    let max_distance = upper_distance.max(gps_precision_m + gps_precision_m);
    let runs = divide_if(sequence, |p1, p2| {
        geodesy::distance(&p1.point, &p2.point) > max_distance
    });
    debug!(
        runs = runs.len(),
        max_distance = max_distance,
        "Split track on distance"
    );

    let ground_speeds: Vec<f64> = sequence.iter().filter_map(|p| p.ground_speed).collect();
    let Ok(max_speed) = calculate_upper_limit(&ground_speeds) else {
        return sequence.to_vec();
    };

    let merged = cluster_merge(runs, |p1, p2| estimate_ground_speed(p1, p2) <= max_speed);
    find_dominant(merged)
}

/// Drop points with an unusable fix, too much dilution of precision, or that
/// sit outside the dominant run of the track.
///
/// An empty result means nothing usable survived; callers treat that as a
/// stationary or GPS-less capture.
pub fn cleanse_noisy_points(
    sequence: &[PointWithFix],
    config: &NoiseFilterConfig,
) -> Vec<PointWithFix> {
    let num_points = sequence.len();
    let sequence: Vec<PointWithFix> = sequence
        .iter()
        .filter(|p| match p.fix {
            // points without fix information are kept
            None => true,
            Some(code) => config.allowed_fixes.contains(&code),
        })
        .copied()
        .collect();
    if sequence.len() < num_points {
        debug!(
            removed = num_points - sequence.len(),
            allowed = ?config.allowed_fixes,
            "Removed points with GPS fix outside the whitelist"
        );
    }

    let num_points = sequence.len();
    let sequence: Vec<PointWithFix> = sequence
        .into_iter()
        .filter(|p| p.precision.map_or(true, |dop| dop <= config.max_dop100))
        .collect();
    if sequence.len() < num_points {
        debug!(
            removed = num_points - sequence.len(),
            max_dop100 = config.max_dop100,
            "Removed points with dilution of precision too high"
        );
    }

    let num_points = sequence.len();
    let sequence = purge_outliers(&sequence, config.gps_precision_m);
    if sequence.len() < num_points {
        debug!(
            removed = num_points - sequence.len(),
            "Removed outlier points"
        );
    }

    sequence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::GeoPoint;

    // roughly 1.11 m per 1e-5 degrees of latitude
    fn track_point(time: f64, lat: f64, speed: Option<f64>) -> PointWithFix {
        PointWithFix {
            ground_speed: speed,
            ..PointWithFix::new(GeoPoint::new(time, lat, 29.0))
        }
    }

    #[test]
    fn test_generate_pairs() {
        let empty: [i32; 0] = [];
        assert_eq!(generate_pairs(&empty).count(), 0);
        assert_eq!(generate_pairs(&[1]).count(), 0);

        let items = [1, 2, 3];
        let pairs = generate_pairs(&items);
        let first: Vec<_> = pairs.clone().collect();
        let second: Vec<_> = pairs.collect();
        assert_eq!(first, vec![(&1, &2), (&2, &3)]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_upper_limit_flags_outlier() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0, 100.0];
        let limit = calculate_upper_limit(&values).unwrap();
        assert_eq!(limit, 9.5);
        assert!(100.0 > limit);
        assert!(values[..5].iter().all(|v| *v <= limit));
    }

    #[test]
    fn test_upper_limit_odd_sample_excludes_median() {
        // q1 = median([0, 1]) = 0.5, q3 = median([3, 4]) = 3.5
        let limit = calculate_upper_limit(&[4.0, 0.0, 2.0, 1.0, 3.0]).unwrap();
        assert_eq!(limit, 3.5 + 3.0 * 1.5);
    }

    #[test]
    fn test_upper_limit_requires_two_samples() {
        assert_eq!(
            calculate_upper_limit(&[]),
            Err(StatisticsError::InsufficientSamples {
                required: 2,
                found: 0
            })
        );
        assert!(calculate_upper_limit(&[1.0]).is_err());
        assert_eq!(calculate_upper_limit(&[1.0, 3.0]).unwrap(), 6.0);
    }

    #[test]
    fn test_divide_if_preserves_points() {
        let values = [1, 2, 10, 11, 12, 30];
        let runs = divide_if(&values, |a, b| b - a > 5);
        assert_eq!(runs, vec![vec![1, 2], vec![10, 11, 12], vec![30]]);

        let empty: Vec<Vec<i32>> = divide_if(&[], |_: &i32, _: &i32| true);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_cluster_merge_first_later_match() {
        let runs = vec![vec![1, 2], vec![50, 51], vec![3, 4], vec![52]];
        let merged = cluster_merge(runs, |a: &i32, b: &i32| (b - a).abs() <= 2);
        assert_eq!(merged, vec![vec![1, 2, 3, 4], vec![50, 51, 52]]);
    }

    #[test]
    fn test_cluster_merge_chains_through_merged_runs() {
        let runs = vec![vec![1], vec![2], vec![3]];
        let merged = cluster_merge(runs, |a: &i32, b: &i32| b - a == 1);
        assert_eq!(merged, vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_find_dominant_ties_go_to_first() {
        let groups = vec![vec![1], vec![2, 3], vec![4, 5], vec![6]];
        assert_eq!(find_dominant(groups), vec![2, 3]);
        assert!(find_dominant::<i32>(vec![]).is_empty());
    }

    #[test]
    fn test_ground_speed_zero_elapsed() {
        let a = GeoPoint::new(0.0, 41.0, 29.0);
        let b = GeoPoint::new(0.0, 41.001, 29.0);
        assert!(estimate_ground_speed(&a, &b).is_infinite());

        let c = GeoPoint::new(10.0, 41.001, 29.0);
        let speed = estimate_ground_speed(&a, &c);
        assert!((speed - 11.1).abs() < 0.2, "got {speed}");
    }

    #[test]
    fn test_purge_outliers_drops_spike() {
        let mut track: Vec<PointWithFix> = (0..20)
            .map(|i| track_point(i as f64, 41.0 + i as f64 * 0.00005, Some(6.0)))
            .collect();
        // a single fix 5 km off the road
        track[5] = track_point(5.0, 41.05, Some(6.0));

        let purged = purge_outliers(&track, 15.0);
        assert_eq!(purged.len(), 19);
        assert!(purged.iter().all(|p| p.point.lat < 41.01));
    }

    #[test]
    fn test_purge_outliers_short_track_untouched() {
        let track = vec![track_point(0.0, 41.0, None), track_point(1.0, 42.0, None)];
        assert_eq!(purge_outliers(&track, 15.0), track);
    }

    #[test]
    fn test_cleanse_noisy_points_filters() {
        let config = NoiseFilterConfig::default();
        let mut track: Vec<PointWithFix> = (0..6)
            .map(|i| track_point(i as f64, 41.0 + i as f64 * 0.00005, None))
            .collect();
        track[1].fix = Some(1);
        track[2].precision = Some(5000.0);
        track[3].fix = Some(3);
        track[3].precision = Some(120.0);

        let cleansed = cleanse_noisy_points(&track, &config);
        assert_eq!(cleansed.len(), 4);
        assert!(cleansed.iter().all(|p| p.fix != Some(1)));
        assert!(cleansed.iter().all(|p| p.precision != Some(5000.0)));
    }

    #[test]
    fn test_cleanse_noisy_points_all_rejected() {
        let config = NoiseFilterConfig::default();
        let mut track = vec![track_point(0.0, 41.0, None), track_point(1.0, 41.0001, None)];
        track[0].fix = Some(1);
        track[1].fix = Some(7);

        assert!(cleanse_noisy_points(&track, &config).is_empty());
    }

    #[test]
    fn test_cleanse_noisy_points_uses_loaded_config() {
        let mut config = crate::config::SequencerConfig::default();
        config.noise.allowed_fixes.push(1);

        let mut track: Vec<PointWithFix> = (0..4)
            .map(|i| track_point(i as f64, 41.0 + i as f64 * 0.00005, None))
            .collect();
        track[1].fix = Some(1);

        assert_eq!(cleanse_noisy_points(&track, &config.noise).len(), 4);
        assert_eq!(cleanse_noisy_points(&track, &NoiseFilterConfig::default()).len(), 3);
    }
}
