use thiserror::Error;

use crate::preprocess::Batch;

#[derive(Debug, Error)]
pub enum ModelError {
    #[cfg(feature = "tensorflow")]
    #[error("failed to read model: {0}")]
    Io(#[from] std::io::Error),
    #[cfg(feature = "tensorflow")]
    #[error("tensorflow: {0}")]
    Tensorflow(String),
    #[cfg(feature = "tensorflow")]
    #[error("operation {0:?} not found in graph")]
    MissingOperation(String),
    #[cfg(feature = "tensorflow")]
    #[error("model session is unavailable after an earlier panic")]
    Poisoned,
    #[cfg(not(feature = "tensorflow"))]
    #[error("built without an inference backend; enable the \"tensorflow\" feature")]
    NoBackend,
}

/// Maps one preprocessed batch to a probability per class, in the order the
/// label index file describes.
pub trait Classifier: Send + Sync {
    fn predict(&self, batch: &Batch) -> Result<Vec<f32>, ModelError>;
}

#[cfg(feature = "tensorflow")]
pub use self::tf::TfClassifier;

#[cfg(feature = "tensorflow")]
impl From<tensorflow::Status> for ModelError {
    fn from(status: tensorflow::Status) -> Self {
        ModelError::Tensorflow(status.to_string())
    }
}

#[cfg(feature = "tensorflow")]
mod tf {
    use std::{fs, path::Path, sync::Mutex};

    use tensorflow::{Graph, ImportGraphDefOptions, Session, SessionOptions, SessionRunArgs, Tensor};
    use tracing::debug;

    use super::{Classifier, ModelError};
    use crate::preprocess::Batch;

    struct Loaded {
        session: Session,
        graph: Graph,
    }

    /// Frozen TensorFlow graph. Session runs are serialized.
    pub struct TfClassifier {
        inner: Mutex<Loaded>,
        input_op: String,
        output_op: String,
    }

    impl TfClassifier {
        pub fn load(
            model_path: impl AsRef<Path>,
            input_op: &str,
            output_op: &str,
        ) -> Result<Self, ModelError> {
            let model_bytes = fs::read(model_path)?;

            let mut graph = Graph::new();
            graph.import_graph_def(&model_bytes, &ImportGraphDefOptions::new())?;
            let session = Session::new(&SessionOptions::new(), &graph)?;

            // Fail at startup rather than on the first request.
            for name in [input_op, output_op] {
                graph
                    .operation_by_name(name)?
                    .ok_or_else(|| ModelError::MissingOperation(name.to_string()))?;
            }

            Ok(TfClassifier {
                inner: Mutex::new(Loaded { session, graph }),
                input_op: input_op.to_string(),
                output_op: output_op.to_string(),
            })
        }
    }

    impl Classifier for TfClassifier {
        fn predict(&self, batch: &Batch) -> Result<Vec<f32>, ModelError> {
            let mut input = Tensor::<f32>::new(&batch.shape());
            input.copy_from_slice(batch.as_slice());

            let loaded = self.inner.lock().map_err(|_| ModelError::Poisoned)?;

            let input_operation = loaded
                .graph
                .operation_by_name(&self.input_op)?
                .ok_or_else(|| ModelError::MissingOperation(self.input_op.clone()))?;
            let output_operation = loaded
                .graph
                .operation_by_name(&self.output_op)?
                .ok_or_else(|| ModelError::MissingOperation(self.output_op.clone()))?;

            let mut args = SessionRunArgs::new();
            args.add_feed(&input_operation, 0, &input);
            let output_token = args.request_fetch(&output_operation, 0);
            loaded.session.run(&mut args)?;

            let output: Tensor<f32> = args.fetch(output_token)?;
            debug!(dims = ?output.dims(), "model output");
            Ok(output.to_vec())
        }
    }
}
