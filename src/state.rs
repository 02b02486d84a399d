use crate::{
    config::ErrorPolicy,
    labels::ClassLabelSet,
    model::Classifier,
    prediction::{self, PredictError, PredictionResult},
};

/// Everything a request needs, built once at startup and shared read-only.
pub struct AppState {
    pub classifier: Box<dyn Classifier>,
    pub labels: ClassLabelSet,
    pub error_policy: ErrorPolicy,
    /// Request body limit applied to `/predict`.
    pub body_limit_bytes: usize,
}

impl AppState {
    pub fn new(
        classifier: Box<dyn Classifier>,
        labels: ClassLabelSet,
        error_policy: ErrorPolicy,
        body_limit_bytes: usize,
    ) -> Self {
        AppState {
            classifier,
            labels,
            error_policy,
            body_limit_bytes,
        }
    }

    pub fn classify(
        &self,
        filename: String,
        image_data: &[u8],
    ) -> Result<PredictionResult, PredictError> {
        prediction::classify(
            self.classifier.as_ref(),
            &self.labels,
            filename,
            image_data,
            &mut rand::rng(),
        )
    }
}
