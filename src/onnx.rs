//! ONNX Runtime network backend (feature `onnx`).

#[cfg(feature = "onnx")]
mod inner {
    use std::path::Path;
    use std::sync::Mutex;

    use ort::session::Session;
    use ort::value::Tensor;

    use crate::eval::{EvalError, Network, NetworkOutput};

    /// ONNX Runtime implementation of [`Network`].
    ///
    /// Expects a model with one input named `input` of shape
    /// `[batch, obs_dim]` and two outputs: `value` (`[batch, P]`, raw value
    /// head) and `policy` (`[batch, K]`, global policy logits).
    ///
    /// `ort::Session::run` takes `&mut self`, so the session sits behind a
    /// mutex; this serializes inference, which is fine — the evaluation
    /// service already funnels all traffic through one thread.
    pub struct OrtNetwork {
        session: Mutex<Session>,
    }

    impl OrtNetwork {
        /// Load a model file with the CPU execution provider.
        pub fn from_file(model_path: impl AsRef<Path>) -> Result<Self, EvalError> {
            let session = Session::builder()
                .map_err(ort_error)?
                .with_intra_threads(1)
                .map_err(ort_error)?
                .commit_from_file(model_path)
                .map_err(ort_error)?;
            Ok(Self {
                session: Mutex::new(session),
            })
        }

        /// Load a model file with the CUDA execution provider.
        #[cfg(feature = "onnx-cuda")]
        pub fn from_file_cuda(model_path: impl AsRef<Path>) -> Result<Self, EvalError> {
            let session = Session::builder()
                .map_err(ort_error)?
                .with_intra_threads(1)
                .map_err(ort_error)?
                .with_execution_providers([
                    ort::execution_providers::CUDAExecutionProvider::default().build(),
                ])
                .map_err(ort_error)?
                .commit_from_file(model_path)
                .map_err(ort_error)?;
            Ok(Self {
                session: Mutex::new(session),
            })
        }
    }

    fn ort_error(err: ort::Error) -> EvalError {
        EvalError::Network(err.to_string())
    }

    impl Network for OrtNetwork {
        fn predict(
            &self,
            input: &[f32],
            batch_size: usize,
            obs_dim: usize,
        ) -> Result<NetworkOutput, EvalError> {
            let tensor = Tensor::from_array(([batch_size, obs_dim], input.to_vec()))
                .map_err(ort_error)?;

            let mut session = self.session.lock().unwrap();
            let outputs = session
                .run(ort::inputs!["input" => tensor])
                .map_err(ort_error)?;

            let (_, values) = outputs["value"]
                .try_extract_tensor::<f32>()
                .map_err(ort_error)?;
            let (_, policy_logits) = outputs["policy"]
                .try_extract_tensor::<f32>()
                .map_err(ort_error)?;

            Ok(NetworkOutput {
                values: values.to_vec(),
                policy_logits: policy_logits.to_vec(),
            })
        }
    }
}

#[cfg(feature = "onnx")]
pub use inner::OrtNetwork;
