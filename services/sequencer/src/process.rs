//! The sequencing pass over a whole description file.

use crate::anomaly::AnomalyFilter;
use crate::config::SequencerConfig;
use crate::description::{
    assign_photo_uuids, merge_records, DescriptionFile, FailedEntry, ImageDescription, Summary,
};
use crate::sequence_builder::SequenceBuilder;
use tracing::{info, instrument};

/// Result of sequencing a description file
#[derive(Debug, Clone)]
pub struct SequencingOutcome {
    /// File to write back: accepted images, all failures and the summary
    pub file: DescriptionFile,
    /// Identifiers of images rejected by this pass
    pub failed_images: Vec<String>,
}

impl SequencingOutcome {
    pub fn summary(&self) -> Option<&Summary> {
        self.file.information.as_ref()
    }

    pub fn has_failures(&self) -> bool {
        self.summary().map_or(false, |s| s.failed_images > 0)
    }
}

fn initial_summary(images: usize, failures: &[FailedEntry]) -> Summary {
    let duplicated = failures.iter().filter(|f| f.is_duplicate()).count();
    Summary::new(images + failures.len(), failures.len(), duplicated)
}

/// Rebuild sequences, then filter anomalies and duplicates.
///
/// Images already recorded as failed are carried through unchanged; the
/// summary counts them together with the images rejected here.
#[instrument(skip_all, fields(images = input.images.len()))]
pub fn process_description_file(input: DescriptionFile, config: &SequencerConfig) -> SequencingOutcome {
    let DescriptionFile {
        images,
        mut failures,
        information,
    } = input;

    let information = information.unwrap_or_else(|| initial_summary(images.len(), &failures));

    let (geotags, metadata): (Vec<_>, Vec<_>) = images.into_iter().map(ImageDescription::into_records).unzip();

    let builder = SequenceBuilder::new(config.sequence.clone());
    let sequences = builder.build(&geotags);

    let mut images: Vec<ImageDescription> = geotags
        .into_iter()
        .zip(sequences)
        .zip(metadata)
        .map(|((geotag, sequence), metadata)| merge_records(geotag, sequence, metadata))
        .collect();

    if let Some(email) = &config.account.email {
        assign_photo_uuids(&mut images, email);
    }

    let filter = AnomalyFilter::new(config.anomaly.clone());
    let report = filter.detect(images, Some(&information));

    failures.extend(report.duplicates.iter().map(|d| d.to_entry()));
    failures.extend(report.anomaly_points.iter().map(|p| p.to_entry()));

    info!(
        accepted = report.descriptions.len(),
        rejected = report.failed_images.len(),
        "Sequencing finished"
    );

    SequencingOutcome {
        file: DescriptionFile {
            images: report.descriptions,
            failures,
            information: Some(report.summary),
        },
        failed_images: report.failed_images,
    }
}
