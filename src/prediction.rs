use axum::extract::multipart::MultipartError;
use image::ImageError;
use rand::Rng;
use serde::{ser::SerializeMap, Serialize, Serializer};
use thiserror::Error;
use tokio::task::JoinError;

use crate::{
    disease::{self, Disease, DISEASED_LABEL},
    labels::ClassLabelSet,
    model::{Classifier, ModelError},
    preprocess::preprocess,
};

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("failed to read upload: {0}")]
    Upload(#[from] MultipartError),
    #[error("upload exceeds the {limit} byte request limit")]
    TooLarge { limit: usize },
    #[error("cannot identify image file {filename:?}: {source}")]
    Decode { filename: String, source: ImageError },
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model returned {scores} scores for {labels} labels")]
    ScoreCount { scores: usize, labels: usize },
    #[error("model returned no usable scores")]
    NoScores,
    #[error("prediction task failed: {0}")]
    Task(#[from] JoinError),
}

/// Per-class probabilities, serialized as a JSON object in label order.
#[derive(Debug, Clone, PartialEq)]
pub struct Probabilities(Vec<(String, f32)>);

impl Serialize for Probabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (label, probability) in &self.0 {
            map.serialize_entry(label, probability)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictionResult {
    pub filename: String,
    pub label: String,
    pub confidence: f32,
    pub probabilities: Probabilities,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disease_name: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preventive_measures: Option<&'static [&'static str]>,
}

impl PredictionResult {
    pub fn from_scores(
        filename: String,
        labels: &ClassLabelSet,
        scores: &[f32],
    ) -> Result<Self, PredictError> {
        if scores.len() != labels.len() {
            return Err(PredictError::ScoreCount {
                scores: scores.len(),
                labels: labels.len(),
            });
        }

        let (index, confidence) = argmax(scores).ok_or(PredictError::NoScores)?;
        let label = labels.get(index).ok_or(PredictError::NoScores)?.to_string();
        let probabilities = Probabilities(
            labels
                .iter()
                .map(String::from)
                .zip(scores.iter().copied())
                .collect(),
        );

        Ok(PredictionResult {
            filename,
            label,
            confidence,
            probabilities,
            disease_name: None,
            preventive_measures: None,
        })
    }

    fn attach(&mut self, disease: &'static Disease) {
        self.disease_name = Some(disease.name);
        self.preventive_measures = Some(disease.measures);
    }
}

/// One slot of the response. `Failed` only appears under the isolate policy.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum FileOutcome {
    Predicted(PredictionResult),
    Failed { filename: String, error: String },
}

/// Index and value of the highest score. Ties go to the lowest index; NaN
/// never wins.
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        if best.map_or(true, |(_, top)| score > top) {
            best = Some((index, score));
        }
    }
    best
}

/// Decode, run the classifier, pick the top class and, for a diseased
/// prediction, attach a catalog entry drawn from `rng`.
pub fn classify<R: Rng + ?Sized>(
    classifier: &dyn Classifier,
    labels: &ClassLabelSet,
    filename: String,
    image_data: &[u8],
    rng: &mut R,
) -> Result<PredictionResult, PredictError> {
    let batch = match preprocess(image_data) {
        Ok(batch) => batch,
        Err(source) => return Err(PredictError::Decode { filename, source }),
    };
    let scores = classifier.predict(&batch)?;

    let mut result = PredictionResult::from_scores(filename, labels, &scores)?;
    if result.label == DISEASED_LABEL {
        result.attach(disease::pick(rng));
    }
    Ok(result)
}
