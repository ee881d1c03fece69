//! Per-user voice activity detection
//!
//! Two interchangeable backends behind one event contract: a Silero
//! neural detector (feature `neural-vad`, 32 ms windows) and an RMS
//! energy detector. The neural model loads asynchronously; until it is
//! ready, and after any load or inference failure, frames take the RMS
//! path. The downgrade is one-way for the lifetime of the detector.

use crate::audio::{rms, PROCESSING_SAMPLE_RATE};
use crate::settings::VadSettings;
use tracing::debug;
#[cfg(feature = "neural-vad")]
use tracing::warn;

/// Maps the configured 0..1 threshold into int16 RMS energy
const RMS_THRESHOLD_SCALE: f32 = 1600.0;

/// Window size for the neural detector (32 ms at 16 kHz)
#[cfg(feature = "neural-vad")]
const NEURAL_WINDOW_SAMPLES: usize = 512;

/// Detector event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// The user started speaking
    SpeechStart,
    /// The utterance ended (silence window elapsed)
    SpeechEnd,
}

#[cfg(feature = "neural-vad")]
mod neural {
    //! Silero VAD v5 over ONNX Runtime

    use ndarray::Array2;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::Tensor;

    /// Stateful Silero inference wrapper
    pub struct NeuralModel {
        session: Session,
        /// LSTM hidden state
        h_state: Array2<f32>,
        /// LSTM cell state
        c_state: Array2<f32>,
    }

    impl NeuralModel {
        /// Load the model from an ONNX file (blocking)
        pub fn load(model_path: &str) -> Result<Self, String> {
            let session = Session::builder()
                .map_err(|e| e.to_string())?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| e.to_string())?
                .with_intra_threads(1)
                .map_err(|e| e.to_string())?
                .commit_from_file(model_path)
                .map_err(|e| e.to_string())?;

            Ok(Self {
                session,
                h_state: Array2::zeros((2, 64)),
                c_state: Array2::zeros((2, 64)),
            })
        }

        /// Speech probability for one 512-sample window
        pub fn predict(&mut self, window: &[f32], sample_rate: u32) -> Result<f32, String> {
            let input = Array2::from_shape_vec((1, window.len()), window.to_vec())
                .map_err(|e| e.to_string())?;
            let sr = ndarray::arr1(&[sample_rate as i64]);

            let input_tensor = Tensor::from_array(input).map_err(|e| e.to_string())?;
            let sr_tensor = Tensor::from_array(sr).map_err(|e| e.to_string())?;
            let h_tensor = Tensor::from_array(self.h_state.clone()).map_err(|e| e.to_string())?;
            let c_tensor = Tensor::from_array(self.c_state.clone()).map_err(|e| e.to_string())?;

            let outputs = self
                .session
                .run(ort::inputs![
                    "input" => input_tensor,
                    "sr" => sr_tensor,
                    "h" => h_tensor,
                    "c" => c_tensor,
                ])
                .map_err(|e| e.to_string())?;

            let (_, probabilities) = outputs
                .get("output")
                .ok_or_else(|| "Missing output tensor".to_string())?
                .try_extract_tensor::<f32>()
                .map_err(|e| e.to_string())?;
            let probability = probabilities.first().copied().unwrap_or(0.0);

            for (key, state) in [("hn", &mut self.h_state), ("cn", &mut self.c_state)] {
                if let Some(tensor) = outputs.get(key) {
                    let (shape, data) = tensor
                        .try_extract_tensor::<f32>()
                        .map_err(|e| e.to_string())?;
                    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
                    if dims.len() == 2 && data.len() == dims[0] * dims[1] {
                        let view = ndarray::ArrayView2::from_shape((dims[0], dims[1]), data)
                            .map_err(|e| e.to_string())?;
                        state.assign(&view);
                    }
                }
            }

            Ok(probability)
        }
    }
}

#[cfg(feature = "neural-vad")]
type LoadSlot = std::sync::Arc<parking_lot::Mutex<Option<Result<neural::NeuralModel, String>>>>;

#[cfg(feature = "neural-vad")]
enum NeuralState {
    /// Background load in flight; the task deposits its result in the slot
    Loading {
        slot: LoadSlot,
        handle: tokio::task::JoinHandle<()>,
    },
    Ready(Box<neural::NeuralModel>),
    /// Load or inference failed; RMS from here on
    Downgraded,
}

/// Per-user stateful detector over 16 kHz mono frames
pub struct VoiceDetector {
    config: VadSettings,
    speaking: bool,
    /// Silence accumulated while speaking, in milliseconds
    silence_ms: f64,
    /// Speech accumulated before start is emitted, in milliseconds
    pending_speech_ms: f64,
    disposed: bool,
    #[cfg(feature = "neural-vad")]
    neural: Option<NeuralState>,
    #[cfg(feature = "neural-vad")]
    window: Vec<f32>,
}

impl VoiceDetector {
    /// Create a detector for one user
    pub fn new(config: VadSettings) -> Self {
        #[cfg(feature = "neural-vad")]
        let neural = if config.engine == "neural" {
            let model_path = config
                .model_path
                .clone()
                .or_else(|| std::env::var(lyra_core::config::VAD_MODEL_PATH).ok());
            match model_path {
                Some(path) => {
                    let slot: LoadSlot = std::sync::Arc::new(parking_lot::Mutex::new(None));
                    let task_slot = slot.clone();
                    let handle = tokio::task::spawn_blocking(move || {
                        *task_slot.lock() = Some(neural::NeuralModel::load(&path));
                    });
                    Some(NeuralState::Loading { slot, handle })
                }
                None => {
                    debug!("No VAD model path configured, using RMS detection");
                    None
                }
            }
        } else {
            None
        };

        Self {
            config,
            speaking: false,
            silence_ms: 0.0,
            pending_speech_ms: 0.0,
            disposed: false,
            #[cfg(feature = "neural-vad")]
            neural,
            #[cfg(feature = "neural-vad")]
            window: Vec::with_capacity(NEURAL_WINDOW_SAMPLES),
        }
    }

    /// Whether the detector currently considers the user to be speaking
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Process one frame of 16 kHz mono PCM, returning boundary events
    pub fn process(&mut self, pcm: &[i16]) -> Vec<VadEvent> {
        if self.disposed || pcm.is_empty() {
            return Vec::new();
        }

        #[cfg(feature = "neural-vad")]
        if self.neural_ready() {
            return self.process_neural(pcm);
        }

        let frame_ms = pcm.len() as f64 * 1000.0 / PROCESSING_SAMPLE_RATE as f64;
        let threshold = (self.config.threshold * RMS_THRESHOLD_SCALE) as f64;
        let is_speech = rms(pcm) > threshold;
        self.advance(is_speech, frame_ms, false)
    }

    /// Settle the load state; true once the model can run. While loading,
    /// and permanently after a failure, frames take the RMS path.
    #[cfg(feature = "neural-vad")]
    fn neural_ready(&mut self) -> bool {
        match self.neural.take() {
            None => false,
            Some(NeuralState::Downgraded) => {
                self.neural = Some(NeuralState::Downgraded);
                false
            }
            Some(NeuralState::Ready(model)) => {
                self.neural = Some(NeuralState::Ready(model));
                true
            }
            Some(NeuralState::Loading { slot, handle }) => {
                let result = slot.lock().take();
                match result {
                    None => {
                        self.neural = Some(NeuralState::Loading { slot, handle });
                        false
                    }
                    Some(Ok(model)) => {
                        debug!("Neural VAD model ready");
                        self.neural = Some(NeuralState::Ready(Box::new(model)));
                        true
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Neural VAD load failed, downgrading to RMS");
                        self.neural = Some(NeuralState::Downgraded);
                        false
                    }
                }
            }
        }
    }

    /// Buffer the frame and run inference per full 32 ms window
    #[cfg(feature = "neural-vad")]
    fn process_neural(&mut self, pcm: &[i16]) -> Vec<VadEvent> {
        let Some(NeuralState::Ready(mut model)) = self.neural.take() else {
            return Vec::new();
        };

        self.window.extend(pcm.iter().map(|&s| s as f32 / 32768.0));
        let window_ms = NEURAL_WINDOW_SAMPLES as f64 * 1000.0 / PROCESSING_SAMPLE_RATE as f64;
        let mut events = Vec::new();

        while self.window.len() >= NEURAL_WINDOW_SAMPLES {
            let window: Vec<f32> = self.window.drain(..NEURAL_WINDOW_SAMPLES).collect();
            match model.predict(&window, PROCESSING_SAMPLE_RATE) {
                Ok(probability) => {
                    let is_speech = probability > self.config.threshold;
                    events.extend(self.advance(is_speech, window_ms, true));
                }
                Err(e) => {
                    warn!(error = %e, "Neural VAD inference failed, downgrading to RMS");
                    self.neural = Some(NeuralState::Downgraded);
                    self.window.clear();
                    return events;
                }
            }
        }

        self.neural = Some(NeuralState::Ready(model));
        events
    }

    /// Shared start/end state machine
    fn advance(&mut self, is_speech: bool, frame_ms: f64, gate_min_speech: bool) -> Vec<VadEvent> {
        let mut events = Vec::new();

        if is_speech {
            self.silence_ms = 0.0;
            if !self.speaking {
                self.pending_speech_ms += frame_ms;
                let min_speech = if gate_min_speech {
                    self.config.min_speech_duration_ms as f64
                } else {
                    0.0
                };
                if self.pending_speech_ms >= min_speech {
                    self.speaking = true;
                    self.pending_speech_ms = 0.0;
                    events.push(VadEvent::SpeechStart);
                }
            }
        } else {
            self.pending_speech_ms = 0.0;
            if self.speaking {
                self.silence_ms += frame_ms;
                if self.silence_ms >= self.config.silence_duration_ms as f64 {
                    self.speaking = false;
                    self.silence_ms = 0.0;
                    events.push(VadEvent::SpeechEnd);
                }
            }
        }

        events
    }

    /// Tear down the detector; idempotent, and waits out any in-flight
    /// model load so the task cannot outlive the session
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        debug!("Voice detector disposed");

        #[cfg(feature = "neural-vad")]
        if let Some(NeuralState::Loading { handle, .. }) = self.neural.take() {
            let _ = handle.await;
        }
    }
}
