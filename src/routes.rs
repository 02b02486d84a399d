use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{
    config::ErrorPolicy,
    prediction::{FileOutcome, PredictError},
    state::AppState,
};

pub type SharedState = Arc<AppState>;

/// Multipart field carrying the uploaded images.
const FILES_FIELD: &str = "files";

/// Response body of `/predict`. Always sent with status 200.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predictions: Option<Vec<FileOutcome>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    fn success(predictions: Vec<FileOutcome>) -> Self {
        Envelope {
            success: true,
            predictions: Some(predictions),
            error: None,
        }
    }

    fn failure(error: String) -> Self {
        Envelope {
            success: false,
            predictions: None,
            error: Some(error),
        }
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/predict", post(predict_handler))
        .route("/health", get(health_check))
        .layer(DefaultBodyLimit::max(state.body_limit_bytes))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn predict_handler(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Json<Envelope> {
    match predict_files(&state, &mut multipart).await {
        Ok(predictions) => {
            info!(files = predictions.len(), "prediction request served");
            Json(Envelope::success(predictions))
        }
        Err(err) => {
            warn!(error = %err, "prediction request failed");
            Json(Envelope::failure(err.to_string()))
        }
    }
}

/// Classifies each `files` part in upload order, one at a time.
async fn predict_files(
    state: &SharedState,
    multipart: &mut Multipart,
) -> Result<Vec<FileOutcome>, PredictError> {
    let mut outcomes = Vec::new();

    let limit = state.body_limit_bytes;
    let read_error = |err| upload_error(err, limit);

    while let Some(field) = multipart.next_field().await.map_err(read_error)? {
        if field.name() != Some(FILES_FIELD) {
            continue;
        }
        let filename = field.file_name().unwrap_or_default().to_string();
        let contents = field.bytes().await.map_err(read_error)?;

        let task_state = Arc::clone(state);
        let task_filename = filename.clone();
        let result =
            tokio::task::spawn_blocking(move || task_state.classify(task_filename, &contents))
                .await?;

        match result {
            Ok(prediction) => outcomes.push(FileOutcome::Predicted(prediction)),
            Err(err) if state.error_policy == ErrorPolicy::Isolate => {
                warn!(%filename, error = %err, "file failed, continuing");
                outcomes.push(FileOutcome::Failed {
                    filename,
                    error: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }

    Ok(outcomes)
}

/// The body limit surfaces as a multipart read error; name it as such.
fn upload_error(err: MultipartError, limit: usize) -> PredictError {
    if exceeds_limit(&err) {
        PredictError::TooLarge { limit }
    } else {
        PredictError::Upload(err)
    }
}

fn exceeds_limit(err: &MultipartError) -> bool {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if inner.to_string().contains("length limit exceeded") {
            return true;
        }
        source = inner.source();
    }
    false
}

async fn health_check(State(state): State<SharedState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "OK", "classes": state.labels.len() }))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use axum::{
        body::Body,
        http::{header, Method, Request},
    };
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        disease::{self, DISEASES},
        labels::ClassLabelSet,
        model::{
            testing::{BrightnessClassifier, FailingClassifier, FixedClassifier},
            Classifier,
        },
    };

    const BOUNDARY: &str = "silkworm-test-boundary";

    fn app_with(classifier: impl Classifier + 'static, policy: ErrorPolicy) -> Router {
        app_limited(classifier, policy, 10 * 1024 * 1024)
    }

    fn app_limited(
        classifier: impl Classifier + 'static,
        policy: ErrorPolicy,
        body_limit_bytes: usize,
    ) -> Router {
        let labels = ClassLabelSet::from_json(r#"{"diseased": 0, "healthy": 1}"#).unwrap();
        let state = Arc::new(AppState::new(
            Box::new(classifier),
            labels,
            policy,
            body_limit_bytes,
        ));
        router(state)
    }

    fn app() -> Router {
        app_with(BrightnessClassifier { classes: 2 }, ErrorPolicy::Abort)
    }

    fn png(value: u8) -> Vec<u8> {
        let image = RgbImage::from_pixel(32, 24, Rgb([value, value, value]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
            .unwrap();
        bytes
    }

    /// `(field name, file name, contents)` parts as a multipart body.
    fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, contents) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            let disposition = match filename {
                Some(filename) => {
                    format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n")
                }
                None => format!("Content-Disposition: form-data; name=\"{name}\"\r\n"),
            };
            body.extend_from_slice(disposition.as_bytes());
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
            body.extend_from_slice(contents);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn predict_request(parts: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap()
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn single_image_reports_consistent_probabilities() {
        let image = png(200);
        let (status, body) =
            send(app(), predict_request(&[("files", Some("leaf.png"), image.as_slice())])).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let predictions = body["predictions"].as_array().unwrap();
        assert_eq!(predictions.len(), 1);

        let prediction = &predictions[0];
        assert_eq!(prediction["filename"], "leaf.png");
        let probabilities = prediction["probabilities"].as_object().unwrap();
        let mut keys: Vec<&str> = probabilities.keys().map(String::as_str).collect();
        keys.sort();
        assert_eq!(keys, vec!["diseased", "healthy"]);

        let values: Vec<f64> = probabilities.values().map(|v| v.as_f64().unwrap()).collect();
        let sum: f64 = values.iter().sum();
        assert!((sum - 1.0).abs() < 1e-4, "sum was {sum}");

        let confidence = prediction["confidence"].as_f64().unwrap();
        let max = values.iter().cloned().fold(f64::MIN, f64::max);
        assert_eq!(confidence, max);
        let label = prediction["label"].as_str().unwrap();
        assert_eq!(probabilities[label].as_f64().unwrap(), confidence);

        assert_eq!(label, "healthy");
        assert!(prediction.get("disease_name").is_none());
        assert!(prediction.get("preventive_measures").is_none());
    }

    #[tokio::test]
    async fn diseased_image_carries_catalog_entry() {
        let image = png(10);
        let (_, body) =
            send(app(), predict_request(&[("files", Some("larva.jpg"), image.as_slice())])).await;

        let prediction = &body["predictions"][0];
        assert_eq!(prediction["label"], "diseased");

        let name = prediction["disease_name"].as_str().unwrap();
        let entry = disease::by_name(name).unwrap();
        assert!(DISEASES.iter().any(|d| d.name == name));
        let measures: Vec<&str> = prediction["preventive_measures"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m.as_str().unwrap())
            .collect();
        assert_eq!(measures, entry.measures);
    }

    #[tokio::test]
    async fn results_keep_upload_order() {
        let bright = png(240);
        let dark = png(15);
        let (_, body) = send(
            app(),
            predict_request(&[
                ("files", Some("a.jpg"), bright.as_slice()),
                ("files", Some("b.jpg"), dark.as_slice()),
            ]),
        )
        .await;

        let predictions = body["predictions"].as_array().unwrap();
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0]["filename"], "a.jpg");
        assert_eq!(predictions[0]["label"], "healthy");
        assert_eq!(predictions[1]["filename"], "b.jpg");
        assert_eq!(predictions[1]["label"], "diseased");
    }

    #[tokio::test]
    async fn non_image_aborts_the_whole_batch() {
        let image = png(200);
        let (status, body) = send(
            app(),
            predict_request(&[
                ("files", Some("a.jpg"), image.as_slice()),
                ("files", Some("notes.jpg"), &b"just some text"[..]),
                ("files", Some("c.jpg"), image.as_slice()),
            ]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert!(!body["error"].as_str().unwrap().is_empty());
        assert!(body.get("predictions").is_none());
    }

    #[tokio::test]
    async fn isolate_policy_reports_failures_in_place() {
        let image = png(200);
        let app = app_with(BrightnessClassifier { classes: 2 }, ErrorPolicy::Isolate);
        let (_, body) = send(
            app,
            predict_request(&[
                ("files", Some("a.jpg"), image.as_slice()),
                ("files", Some("notes.jpg"), &b"just some text"[..]),
                ("files", Some("c.jpg"), image.as_slice()),
            ]),
        )
        .await;

        assert_eq!(body["success"], true);
        let predictions = body["predictions"].as_array().unwrap();
        assert_eq!(predictions.len(), 3);
        assert_eq!(predictions[0]["label"], "healthy");
        assert_eq!(predictions[1]["filename"], "notes.jpg");
        assert!(!predictions[1]["error"].as_str().unwrap().is_empty());
        assert!(predictions[1].get("label").is_none());
        assert_eq!(predictions[2]["filename"], "c.jpg");
    }

    #[tokio::test]
    async fn no_file_parts_yield_empty_predictions() {
        let (status, body) = send(
            app(),
            predict_request(&[("comment", None, &b"nothing attached"[..])]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["predictions"], Value::Array(vec![]));
    }

    #[tokio::test]
    async fn non_multipart_body_is_rejected_by_transport() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn score_count_mismatch_is_a_request_error() {
        let image = png(200);
        let app = app_with(FixedClassifier(vec![0.2, 0.3, 0.5]), ErrorPolicy::Abort);
        let (status, body) =
            send(app, predict_request(&[("files", Some("a.jpg"), image.as_slice())])).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "model returned 3 scores for 2 labels");
    }

    #[tokio::test]
    async fn inference_failure_discards_earlier_results() {
        let image = png(200);
        let app = app_with(FailingClassifier::after(1), ErrorPolicy::Abort);
        let (status, body) = send(
            app,
            predict_request(&[
                ("files", Some("a.jpg"), image.as_slice()),
                ("files", Some("b.jpg"), image.as_slice()),
            ]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert!(!body["error"].as_str().unwrap().is_empty());
        assert!(body.get("predictions").is_none());
    }

    #[tokio::test]
    async fn oversized_upload_names_the_limit() {
        let payload = vec![7u8; 10_000];
        let app = app_limited(BrightnessClassifier { classes: 2 }, ErrorPolicy::Abort, 1024);
        let (status, body) = send(
            app,
            predict_request(&[("files", Some("big.jpg"), payload.as_slice())]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "upload exceeds the 1024 byte request limit");
        assert!(body.get("predictions").is_none());
    }

    #[tokio::test]
    async fn health_reports_label_count() {
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "OK", "classes": 2 }));
    }

    #[tokio::test]
    async fn any_origin_may_call_predict() {
        let image = png(200);
        let mut request = predict_request(&[("files", Some("a.jpg"), image.as_slice())]);
        request
            .headers_mut()
            .insert(header::ORIGIN, "https://farm.example".parse().unwrap());

        let response = app().oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }
}
