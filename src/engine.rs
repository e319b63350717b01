use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, mpsc},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use kornia_image::{Image, allocator::CpuAllocator};

use crate::analyzer::Analyzer;
use crate::error::VqaError;
use crate::generation::GenerationConfig;
use crate::model::VisionLanguageModel;

/// Represents the current state of the inference engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// The engine is idle and ready to accept new requests.
    Idle,
    /// The engine is currently answering a request.
    Processing,
}

impl EngineState {
    /// Returns the state as a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Processing => "processing",
        }
    }
}

/// A question about an image.
pub struct AnalyzeRequest {
    pub image: Image<u8, 3, CpuAllocator>,
    pub query: String,
    pub config: GenerationConfig,
}

/// The answer to an [`AnalyzeRequest`] with its telemetry.
pub struct AnalyzeResponse {
    /// Identifier assigned when the request was queued.
    pub id: u64,
    /// Total time taken for the inference.
    pub duration: Duration,
    pub prediction: String,
    /// The analyzed image, handed back to the caller.
    pub image: Image<u8, 3, CpuAllocator>,
}

struct EngineRequest {
    id: u64,
    request: AnalyzeRequest,
    reply_tx: mpsc::Sender<Result<AnalyzeResponse, VqaError>>,
}

/// Runs an [`Analyzer`] on a dedicated thread and serializes requests to it.
///
/// The model is moved to the worker thread, callers block until their own answer is ready.
/// A failing or panicking request is reported to its caller and does not stop the worker.
pub struct Engine<M: VisionLanguageModel + Send + 'static> {
    state: Arc<Mutex<EngineState>>,
    req_tx: Mutex<Option<mpsc::Sender<EngineRequest>>>,
    inference_handle: Mutex<Option<JoinHandle<Analyzer<M>>>>,
    id_counter: Mutex<u64>,
}

impl<M: VisionLanguageModel + Send + 'static> Engine<M> {
    /// Creates the engine and spawns its worker thread.
    pub fn new(mut analyzer: Analyzer<M>) -> Self {
        let (req_tx, req_rx) = mpsc::channel::<EngineRequest>();
        let state = Arc::new(Mutex::new(EngineState::Idle));

        let inference_handle = std::thread::spawn({
            let state = state.clone();
            move || {
                while let Ok(req) = req_rx.recv() {
                    log::debug!("Running inference #{}", req.id);

                    set_state(&state, EngineState::Processing);
                    let start_time = Instant::now();

                    let request = req.request;
                    let answer = catch_unwind(AssertUnwindSafe(|| {
                        analyzer.answer(&request.image, &request.query, &request.config)
                    }))
                    .unwrap_or_else(|payload| Err(VqaError::panicked(payload)));
                    let result = answer.map(|prediction| AnalyzeResponse {
                        id: req.id,
                        duration: start_time.elapsed(),
                        prediction,
                        image: request.image,
                    });

                    match &result {
                        Ok(response) => log::info!(
                            "Inference #{} completed in {:.2?}",
                            response.id,
                            response.duration
                        ),
                        Err(e) => log::error!("Inference #{} failed: {e}", req.id),
                    }

                    set_state(&state, EngineState::Idle);
                    let _ = req.reply_tx.send(result);
                }
                analyzer
            }
        });

        Self {
            state,
            req_tx: Mutex::new(Some(req_tx)),
            inference_handle: Mutex::new(Some(inference_handle)),
            id_counter: Mutex::new(0),
        }
    }

    /// Returns the current state of the engine.
    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues the request and blocks until it is answered.
    pub fn analyze(&self, request: AnalyzeRequest) -> Result<AnalyzeResponse, VqaError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let id = {
            let mut counter = self.id_counter.lock().unwrap_or_else(|e| e.into_inner());
            let id = *counter;
            *counter += 1;
            id
        };

        {
            let req_tx = self.req_tx.lock().unwrap_or_else(|e| e.into_inner());
            let Some(tx) = req_tx.as_ref() else {
                return Err(VqaError::EngineStopped);
            };
            tx.send(EngineRequest {
                id,
                request,
                reply_tx,
            })
            .map_err(|_| VqaError::EngineStopped)?;
        }

        reply_rx.recv().map_err(|_| VqaError::EngineStopped)?
    }

    /// Stops the engine and hands back the analyzer.
    ///
    /// Queued requests are answered before the worker exits. Returns `None` if the engine was
    /// already stopped or the worker panicked.
    pub fn stop(&self) -> Option<Analyzer<M>> {
        self.req_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self
            .inference_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        handle.join().ok()
    }
}

impl<M: VisionLanguageModel + Send + 'static> Drop for Engine<M> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<EngineState>, value: EngineState) {
    *state.lock().unwrap_or_else(|e| e.into_inner()) = value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::AnalyzerConfig;
    use crate::model::fake::ScriptedModel;
    use kornia_image::ImageSize;

    fn request(
        query: &str,
        max_new_tokens: usize,
    ) -> Result<AnalyzeRequest, Box<dyn std::error::Error>> {
        Ok(AnalyzeRequest {
            image: Image::from_size_val(
                ImageSize {
                    width: 2,
                    height: 2,
                },
                0,
                CpuAllocator,
            )?,
            query: query.to_string(),
            config: GenerationConfig::new(max_new_tokens, 1),
        })
    }

    fn engine(reply: &str) -> Engine<ScriptedModel> {
        Engine::new(Analyzer::new(
            ScriptedModel::new(reply),
            AnalyzerConfig::chat(),
        ))
    }

    #[test]
    fn answers_requests_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let engine = engine("two birds");

        let first = engine.analyze(request("how many birds?", 768)?)?;
        let second = engine.analyze(request("again?", 3)?)?;

        assert_eq!(first.prediction, "two birds");
        assert_eq!(second.prediction, "two");
        assert_eq!((first.id, second.id), (0, 1));
        assert_eq!(engine.state(), EngineState::Idle);
        Ok(())
    }

    #[test]
    fn failed_request_keeps_worker_alive() -> Result<(), Box<dyn std::error::Error>> {
        let engine = engine("ok");

        let failed = engine.analyze(request("q", 0)?);
        assert!(matches!(failed, Err(VqaError::InvalidConfig(_))));

        assert_eq!(engine.analyze(request("q", 10)?)?.prediction, "ok");
        Ok(())
    }

    #[test]
    fn huge_budget_does_not_kill_worker() -> Result<(), Box<dyn std::error::Error>> {
        let engine = engine("ok");

        let huge = engine.analyze(request("q", usize::MAX / 4)?)?;
        assert_eq!(huge.prediction, "ok");

        assert_eq!(engine.analyze(request("q", 768)?)?.prediction, "ok");
        Ok(())
    }

    #[test]
    fn panicking_model_keeps_worker_alive() -> Result<(), Box<dyn std::error::Error>> {
        let engine = Engine::new(Analyzer::new(
            ScriptedModel::new("fine").panic_on("explode"),
            AnalyzerConfig::chat(),
        ));

        let failed = engine.analyze(request("explode now", 10)?);
        assert!(matches!(
            failed,
            Err(VqaError::Panicked(message)) if message.contains("explode")
        ));
        assert_eq!(engine.state(), EngineState::Idle);

        assert_eq!(engine.analyze(request("are you ok?", 10)?)?.prediction, "fine");
        Ok(())
    }

    #[test]
    fn stop_returns_analyzer_and_rejects_new_work() -> Result<(), Box<dyn std::error::Error>> {
        let engine = engine("ok");
        engine.analyze(request("first", 10)?)?;

        let analyzer = engine.stop().expect("worker returns the analyzer");
        assert_eq!(analyzer.model().prompts.len(), 1);

        assert!(matches!(
            engine.analyze(request("late", 10)?),
            Err(VqaError::EngineStopped)
        ));
        assert!(engine.stop().is_none());
        Ok(())
    }

    #[test]
    fn concurrent_callers_each_get_their_answer() -> Result<(), Box<dyn std::error::Error>> {
        let engine = engine("abcdef");

        let predictions = std::thread::scope(|s| {
            let handles = (1..=4)
                .map(|n| {
                    let engine = &engine;
                    s.spawn(move || {
                        let req = request("q", n).expect("request");
                        engine.analyze(req).map(|r| r.prediction)
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|h| h.join().expect("caller thread"))
                .collect::<Result<Vec<_>, _>>()
        })?;

        assert_eq!(predictions, vec!["a", "ab", "abc", "abcd"]);
        Ok(())
    }
}
