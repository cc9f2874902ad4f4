use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use atelier_contracts::collaborators::{
    AnalysisReport, MetadataStore, ObjectStorage, VisionAnalyzer,
};
use atelier_contracts::events::{now_utc_iso, EventLog, PipelineEvent};
use atelier_contracts::models::{EditRouter, GenerationParams, ModelVariant};
use atelier_contracts::pipeline::{
    AnalysisResult, GenerationResult, ImageAnalysis, PipelineAction, PipelineRequest,
    PipelineResponse, PipelineStage, SaveResult, SavedArtifact, SourceImage, StageError,
    StepSummary,
};
use atelier_contracts::tasks::{Artifact, MediaKind, TaskStatus};

use crate::analysis::DEFAULT_ANALYSIS_PROMPT;
use crate::coordinator::{encode_image_prompt, variant_of, GenerationCoordinator};
use crate::error::{EngineResult, GenerationError};
use crate::short_id;

/// Model, parameters and attachments after action resolution.
#[derive(Debug, Clone)]
struct GenerationPlan {
    variant: ModelVariant,
    params: GenerationParams,
    attachments: Vec<SourceImage>,
    rerouted_from: Option<ModelVariant>,
    fallback_reason: Option<String>,
}

/// Runs generation, then the optional save and analysis stages, and reports
/// each stage on its own. [`PipelineDispatcher::run`] never fails; every
/// error ends up in the response.
///
/// One dispatcher serves many concurrent runs. Each run blocks the thread
/// that called `run` while it polls.
pub struct PipelineDispatcher {
    coordinator: Arc<GenerationCoordinator>,
    router: EditRouter,
    storage: Option<Arc<dyn ObjectStorage>>,
    metadata: Option<Arc<dyn MetadataStore>>,
    analyzer: Option<Arc<dyn VisionAnalyzer>>,
    events: Option<EventLog>,
    max_wait: Option<Duration>,
}

impl PipelineDispatcher {
    pub fn new(coordinator: Arc<GenerationCoordinator>) -> Self {
        Self {
            coordinator,
            router: EditRouter::default(),
            storage: None,
            metadata: None,
            analyzer: None,
            events: None,
            max_wait: None,
        }
    }

    pub fn with_router(mut self, router: EditRouter) -> Self {
        self.router = router;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn ObjectStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn VisionAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn run(&self, request: &PipelineRequest) -> PipelineResponse {
        let started = Instant::now();
        info!(
            action = request.action.as_str(),
            model = %request.model,
            save = request.save_options.enabled,
            analyze = request.analysis_options.enabled,
            "pipeline started"
        );
        self.emit(&PipelineEvent::PipelineStarted {
            action: request.action,
            model: request.model.clone(),
            source_images: request.source_images.len(),
            save: request.save_options.enabled,
            analyze: request.analysis_options.enabled,
        });

        let mut steps = Vec::new();
        let generation = self.generate(request);
        self.push_step(
            &mut steps,
            PipelineStage::Generation,
            generation.success,
            &generation.message,
        );

        let mut save_result = None;
        let mut analysis_result = None;
        if generation.success {
            if request.save_options.enabled {
                let saved = self.save(request, &generation);
                let message = match &saved.error {
                    Some(error) => error.message.clone(),
                    None => format!("Saved {} artifact(s)", saved.total_saved),
                };
                self.push_step(&mut steps, PipelineStage::Save, saved.success, &message);
                save_result = Some(saved);
            }
            if request.analysis_options.enabled {
                let analyzed = self.analyze(request, &generation, save_result.as_ref());
                let message = match &analyzed.error {
                    Some(error) => error.message.clone(),
                    None => format!("Analyzed {} image(s)", analyzed.total_analyzed),
                };
                self.push_step(
                    &mut steps,
                    PipelineStage::Analysis,
                    analyzed.success,
                    &message,
                );
                analysis_result = Some(analyzed);
            }
        } else if request.save_options.enabled {
            save_result = Some(SaveResult::failed("skipped: generation failed"));
        }

        let success = generation.success
            && save_result.as_ref().map_or(true, |row| row.success)
            && analysis_result.as_ref().map_or(true, |row| row.success);
        let message = if success {
            "Pipeline completed"
        } else {
            "Pipeline completed with issues"
        };
        info!(
            success,
            task_id = generation.task_id.as_deref().unwrap_or(""),
            elapsed_s = started.elapsed().as_secs_f64(),
            "pipeline finished"
        );
        self.emit(&PipelineEvent::PipelineFinished {
            success,
            task_id: generation.task_id.clone(),
            elapsed_s: started.elapsed().as_secs_f64(),
        });

        PipelineResponse {
            success,
            message: message.to_string(),
            steps,
            generation_result: generation,
            save_result,
            analysis_result,
        }
    }

    fn generate(&self, request: &PipelineRequest) -> GenerationResult {
        let plan = match self.plan(request) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(error = %err, "pipeline request rejected");
                return GenerationResult::failed(request.model.clone(), err.to_string());
            }
        };

        let model = plan.variant.as_str();
        let outcome = self.coordinator.submit_and_wait_with(
            model,
            &plan.params,
            &plan.attachments,
            self.max_wait,
            |task| {
                self.emit(&PipelineEvent::TaskSubmitted {
                    task_id: task.id.clone(),
                    model: model.to_string(),
                    backend: task.model.backend(),
                    rerouted_from: plan.rerouted_from.map(|variant| variant.as_str().to_string()),
                })
            },
        );
        match outcome {
            Ok(task) => {
                let mut message = format!("{model} produced {} artifact(s)", task.artifacts.len());
                if let Some(reason) = &plan.fallback_reason {
                    message = format!("{reason} {message}");
                }
                GenerationResult {
                    success: true,
                    task_id: Some(task.id),
                    model: model.to_string(),
                    status: Some(task.status),
                    artifacts: task.artifacts,
                    message,
                    error: None,
                    request_payload: Some(task.payload),
                }
            }
            Err(err) => {
                warn!(model, error = %err, "generation failed");
                let mut result = GenerationResult::failed(model, err.to_string());
                result.status = Some(match err {
                    GenerationError::TimedOut { .. } => TaskStatus::TimedOut,
                    _ => TaskStatus::Error,
                });
                result
            }
        }
    }

    fn plan(&self, request: &PipelineRequest) -> EngineResult<GenerationPlan> {
        if request.action == PipelineAction::Edit && request.source_images.is_empty() {
            return Err(GenerationError::MissingRequiredField {
                model: request.model.clone(),
                field: "source_images".to_string(),
            });
        }

        let requested = variant_of(&request.model)?;
        // Source images make any request an edit, whatever the action says.
        let edits = request.action == PipelineAction::Edit || !request.source_images.is_empty();
        let (variant, fallback_reason) = if edits {
            let route = self
                .router
                .route(requested)
                .map_err(|message| GenerationError::InvalidModel {
                    model: request.model.clone(),
                    expected: message,
                })?;
            (route.variant, route.fallback_reason)
        } else {
            (requested, None)
        };

        let mut params = request.params.clone();
        let mut attachments = Vec::new();
        if variant.is_video() {
            attachments = request.source_images.clone();
        } else if params.image_prompt.is_none() {
            params.image_prompt = request.source_images.first().map(encode_image_prompt);
        }

        Ok(GenerationPlan {
            variant,
            params,
            attachments,
            rerouted_from: Some(requested).filter(|original| *original != variant),
            fallback_reason,
        })
    }

    fn save(&self, request: &PipelineRequest, generation: &GenerationResult) -> SaveResult {
        let Some(storage) = &self.storage else {
            return SaveResult::failed(GenerationError::save("no object storage configured").to_string());
        };
        if generation.artifacts.is_empty() {
            return SaveResult::failed(
                GenerationError::save("generation produced no artifacts").to_string(),
            );
        }
        let selected: &[Artifact] = if request.save_options.save_all {
            &generation.artifacts
        } else {
            &generation.artifacts[..1]
        };

        let mut base_metadata = request.merged_metadata();
        if request.analysis_options.enabled {
            if let Some(prompt) = request.analysis_options.custom_prompt.as_deref() {
                base_metadata.insert("analysis_prompt".to_string(), json!(prompt));
            }
        }

        let total = selected.len();
        let mut saved = Vec::with_capacity(total);
        for (index, artifact) in selected.iter().enumerate() {
            let path = object_path(request, generation, index, artifact);
            match storage.upload(&artifact.bytes, &path) {
                Ok(url) => {
                    let fields = record_fields(
                        &base_metadata,
                        request,
                        generation,
                        artifact,
                        &url,
                        &path,
                        index,
                        total,
                    );
                    let record_id = self.create_record(fields);
                    info!(index, url = %url, "artifact saved");
                    saved.push(SavedArtifact {
                        index,
                        success: true,
                        url: Some(url),
                        path: Some(path),
                        record_id,
                        error: None,
                    });
                }
                Err(err) => {
                    let message = GenerationError::save(&err).to_string();
                    warn!(index, path = %path, error = %message, "artifact save failed");
                    saved.push(SavedArtifact {
                        index,
                        success: false,
                        url: None,
                        path: Some(path),
                        record_id: None,
                        error: Some(message),
                    });
                }
            }
        }

        let total_saved = saved.iter().filter(|row| row.success).count();
        let error = saved
            .iter()
            .find_map(|row| row.error.clone())
            .map(|message| StageError {
                stage: PipelineStage::Save,
                message,
            });
        SaveResult {
            success: error.is_none(),
            saved,
            total_saved,
            error,
        }
    }

    fn create_record(&self, fields: Map<String, Value>) -> Option<String> {
        let store = self.metadata.as_ref()?;
        match store.create_record(fields) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "metadata record not created");
                None
            }
        }
    }

    /// Analyzes every saved image, or every generated image when nothing
    /// was saved, and merges each report into that image's record.
    fn analyze(
        &self,
        request: &PipelineRequest,
        generation: &GenerationResult,
        save: Option<&SaveResult>,
    ) -> AnalysisResult {
        let Some(analyzer) = &self.analyzer else {
            return AnalysisResult::failed(
                GenerationError::analysis("no vision analyzer configured").to_string(),
            );
        };

        let saved: Vec<&SavedArtifact> = save
            .map(|row| row.saved.iter().filter(|saved| saved.success).collect())
            .unwrap_or_default();
        let targets: Vec<(usize, &Artifact, Option<&str>)> = if saved.is_empty() {
            generation
                .artifacts
                .iter()
                .enumerate()
                .map(|(index, artifact)| (index, artifact, None))
                .collect()
        } else {
            saved
                .into_iter()
                .filter_map(|row| {
                    let artifact = generation.artifacts.get(row.index)?;
                    Some((row.index, artifact, row.record_id.as_deref()))
                })
                .collect()
        };
        let images: Vec<_> = targets
            .into_iter()
            .filter(|(_, artifact, _)| artifact.kind == MediaKind::Image)
            .collect();
        if images.is_empty() {
            let cause = if generation.artifacts.is_empty() {
                "generation produced no image to analyze"
            } else {
                "video artifacts cannot be analyzed"
            };
            return AnalysisResult::failed(GenerationError::analysis(cause).to_string());
        }

        let prompt = request
            .analysis_options
            .custom_prompt
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_ANALYSIS_PROMPT);

        let mut results = Vec::with_capacity(images.len());
        for (index, artifact, record_id) in images {
            match analyzer.analyze(&BASE64.encode(&artifact.bytes), prompt) {
                Ok(report) => {
                    if let Some(record_id) = record_id {
                        self.merge_report(record_id, &report);
                    }
                    info!(index, tags = report.tags.len(), "image analyzed");
                    results.push(ImageAnalysis {
                        index,
                        success: true,
                        record_id: record_id.map(str::to_string),
                        report: Some(report),
                        error: None,
                    });
                }
                Err(err) => {
                    let message = GenerationError::analysis(&err).to_string();
                    warn!(index, error = %message, "image analysis failed");
                    results.push(ImageAnalysis {
                        index,
                        success: false,
                        record_id: record_id.map(str::to_string),
                        report: None,
                        error: Some(message),
                    });
                }
            }
        }

        let total_analyzed = results.iter().filter(|row| row.success).count();
        let error = results
            .iter()
            .find_map(|row| row.error.clone())
            .map(|message| StageError {
                stage: PipelineStage::Analysis,
                message,
            });
        AnalysisResult {
            success: error.is_none(),
            report: results.iter().find_map(|row| row.report.clone()),
            images: results,
            total_analyzed,
            error,
        }
    }

    fn merge_report(&self, record_id: &str, report: &AnalysisReport) {
        let Some(store) = &self.metadata else {
            return;
        };
        let mut fields = Map::new();
        fields.insert("summary".to_string(), json!(report.description));
        fields.insert("description".to_string(), json!(report.description));
        fields.insert("products".to_string(), json!(report.products));
        fields.insert("tags".to_string(), json!(report.tags));
        fields.insert("feedback".to_string(), json!(report.feedback));
        fields.insert("analyzed_at".to_string(), json!(now_utc_iso()));
        fields.insert("has_analysis".to_string(), json!(true));
        match store.update_record(record_id, fields) {
            Ok(true) => {}
            Ok(false) => warn!(record_id, "record vanished before analysis was merged"),
            Err(err) => warn!(record_id, error = %format!("{err:#}"), "analysis not merged into record"),
        }
    }

    fn push_step(
        &self,
        steps: &mut Vec<StepSummary>,
        stage: PipelineStage,
        success: bool,
        message: &str,
    ) {
        steps.push(StepSummary {
            step: steps.len() + 1,
            stage,
            success,
            message: message.to_string(),
        });
        self.emit(&PipelineEvent::StageFinished {
            stage,
            success,
            message: message.to_string(),
        });
    }

    fn emit(&self, event: &PipelineEvent) {
        let Some(events) = &self.events else {
            return;
        };
        if let Err(err) = events.emit(event) {
            warn!(event = event.kind(), error = %format!("{err:#}"), "event not written");
        }
    }
}

fn object_path(
    request: &PipelineRequest,
    generation: &GenerationResult,
    index: usize,
    artifact: &Artifact,
) -> String {
    let file_name = format!(
        "{}_{}.{}",
        generation.model,
        short_id(
            &format!("{}:{}", generation.task_id.as_deref().unwrap_or(""), request.params.prompt),
            index as u64
        ),
        artifact.extension()
    );
    match request
        .save_options
        .destination_path
        .as_deref()
        .map(|value| value.trim().trim_matches('/'))
        .filter(|value| !value.is_empty())
    {
        Some(folder) => format!("{folder}/{file_name}"),
        None => file_name,
    }
}

#[allow(clippy::too_many_arguments)]
fn record_fields(
    base: &Map<String, Value>,
    request: &PipelineRequest,
    generation: &GenerationResult,
    artifact: &Artifact,
    url: &str,
    path: &str,
    index: usize,
    total: usize,
) -> Map<String, Value> {
    let mut fields = base.clone();
    fields.insert("prompt".to_string(), json!(request.params.prompt));
    fields.insert("model".to_string(), json!(generation.model));
    fields.insert("task_id".to_string(), json!(generation.task_id));
    fields.insert("url".to_string(), json!(url));
    fields.insert("path".to_string(), json!(path));
    fields.insert(
        "media_type".to_string(),
        json!(match artifact.kind {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }),
    );
    fields.insert("mime_type".to_string(), json!(artifact.mime_type));
    fields.insert("width".to_string(), json!(artifact.width));
    fields.insert("height".to_string(), json!(artifact.height));
    fields.insert("has_transparency".to_string(), json!(artifact.has_transparency));
    fields.insert("image_index".to_string(), json!(index));
    fields.insert("total_images".to_string(), json!(total));
    fields.retain(|_, value| !value.is_null());
    fields
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use serde_json::{json, Map, Value};

    use atelier_contracts::collaborators::{
        AnalysisReport, MetadataStore, ObjectStorage, VisionAnalyzer,
    };
    use atelier_contracts::events::EventLog;
    use atelier_contracts::pipeline::{PipelineAction, PipelineRequest, SourceImage};
    use atelier_contracts::runs::records::FileRecordStore;

    use super::PipelineDispatcher;
    use crate::backends::{BackendSet, FluxBackend, SoraBackend};
    use crate::config::{FluxSettings, PollPolicy, SoraSettings};
    use crate::coordinator::GenerationCoordinator;
    use crate::storage::LocalDirStorage;
    use crate::testing::{bytes_reply, json_reply, tiny_png, ScriptedTransport};
    use crate::transport::{HttpMethod, RequestBody};

    struct FixedAnalyzer {
        prompts: Mutex<Vec<String>>,
    }

    impl VisionAnalyzer for FixedAnalyzer {
        fn analyze(&self, image_b64: &str, prompt: &str) -> anyhow::Result<AnalysisReport> {
            anyhow::ensure!(!image_b64.is_empty(), "empty image");
            if let Ok(mut rows) = self.prompts.lock() {
                rows.push(prompt.to_string());
            }
            Ok(AnalysisReport {
                description: "a red square".to_string(),
                products: "None identified".to_string(),
                tags: vec!["red".to_string(), "square".to_string()],
                feedback: "Add texture.".to_string(),
            })
        }
    }

    struct FailingStore;

    impl MetadataStore for FailingStore {
        fn create_record(&self, _fields: Map<String, Value>) -> anyhow::Result<String> {
            anyhow::bail!("store offline")
        }
        fn query_records(
            &self,
            _filter: &Map<String, Value>,
        ) -> anyhow::Result<Vec<atelier_contracts::collaborators::MetadataRecord>> {
            anyhow::bail!("store offline")
        }
        fn update_record(&self, _id: &str, _fields: Map<String, Value>) -> anyhow::Result<bool> {
            anyhow::bail!("store offline")
        }
        fn delete_record(&self, _id: &str) -> anyhow::Result<bool> {
            anyhow::bail!("store offline")
        }
    }

    fn coordinator(transport: Arc<ScriptedTransport>) -> Arc<GenerationCoordinator> {
        let backends = BackendSet {
            flux: Some(FluxBackend::new(&FluxSettings {
                api_base: "https://flux.test".to_string(),
                api_key: "bfl".to_string(),
            })),
            sora: Some(SoraBackend::new(&SoraSettings {
                base_url: "https://sora.test/video".to_string(),
                deployment: "sora-deploy".to_string(),
                api_key: "az".to_string(),
                api_version: "preview".to_string(),
            })),
        };
        Arc::new(GenerationCoordinator::new(
            transport,
            backends,
            PollPolicy::new(Duration::from_secs(2), Duration::from_millis(5)).expect("valid poll policy"),
        ))
    }

    fn flux_transport(model: &str) -> Arc<ScriptedTransport> {
        Arc::new(
            ScriptedTransport::new()
                .route(HttpMethod::Post, &format!("/v1/{model}"), vec![json_reply(200, json!({"id": "t1"}))])
                .route(
                    HttpMethod::Get,
                    "get_result",
                    vec![json_reply(200, json!({"status": "Ready", "result": {"sample": "https://cdn.test/t1.png"}}))],
                )
                .route(HttpMethod::Get, "cdn.test", vec![bytes_reply(200, "image/png", &tiny_png())]),
        )
    }

    #[test]
    fn edit_on_generate_only_model_falls_back_to_kontext() -> anyhow::Result<()> {
        let transport = flux_transport("flux-kontext");
        let dispatcher = PipelineDispatcher::new(coordinator(transport.clone()));
        let mut request = PipelineRequest::new(PipelineAction::Edit, "flux-pro", "add a hat");
        request
            .source_images
            .push(SourceImage::new("ref.png", "image/png", b"hello".to_vec()));

        let response = dispatcher.run(&request);
        assert!(response.success, "{:?}", response.generation_result.error);
        assert_eq!(response.generation_result.model, "flux-kontext");
        assert!(response
            .generation_result
            .message
            .starts_with("'flux-pro' cannot edit images; routed to 'flux-kontext'."));

        let posts: Vec<_> = transport
            .requests()
            .into_iter()
            .filter(|request| request.method == HttpMethod::Post)
            .collect();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].url.ends_with("/v1/flux-kontext"));
        let RequestBody::Json(body) = &posts[0].body else {
            anyhow::bail!("expected JSON body");
        };
        assert_eq!(body["image_prompt"], json!("aGVsbG8="));
        Ok(())
    }

    #[test]
    fn video_edit_sends_every_source_image() -> anyhow::Result<()> {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route(HttpMethod::Post, "/generations/jobs", vec![json_reply(201, json!({"id": "job-1"}))])
                .route(
                    HttpMethod::Get,
                    "/generations/jobs/job-1",
                    vec![json_reply(200, json!({"status": "succeeded", "generations": [{"id": "g1"}]}))],
                )
                .route(HttpMethod::Get, "/content/video", vec![bytes_reply(200, "video/mp4", b"mp4")]),
        );
        let dispatcher = PipelineDispatcher::new(coordinator(transport.clone()))
            .with_analyzer(Arc::new(FixedAnalyzer {
                prompts: Mutex::new(Vec::new()),
            }));
        let mut request = PipelineRequest::new(PipelineAction::Edit, "sora", "make it move");
        request.analysis_options.enabled = true;
        request.source_images = vec![
            SourceImage::new("a.png", "image/png", vec![1]),
            SourceImage::new("b.png", "image/png", vec![2]),
        ];

        let response = dispatcher.run(&request);
        assert!(response.generation_result.success);
        let analysis = response.analysis_result.clone().unwrap_or_else(|| panic!("analysis"));
        assert!(!analysis.success);
        assert!(analysis
            .error
            .map(|error| error.message.contains("video artifacts cannot be analyzed"))
            .unwrap_or(false));
        assert!(!response.success);

        let RequestBody::Multipart(form) = &transport.requests()[0].body else {
            anyhow::bail!("expected multipart body");
        };
        assert_eq!(form.files.len(), 2);
        Ok(())
    }

    #[test]
    fn save_and_analysis_share_the_record() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = Arc::new(FileRecordStore::new(temp.path().join("records.json")));
        let analyzer = Arc::new(FixedAnalyzer {
            prompts: Mutex::new(Vec::new()),
        });
        let events_path = temp.path().join("events.jsonl");
        let dispatcher = PipelineDispatcher::new(coordinator(flux_transport("flux-pro")))
            .with_storage(Arc::new(LocalDirStorage::new(temp.path().join("media"))))
            .with_metadata(store.clone())
            .with_analyzer(analyzer.clone())
            .with_events(EventLog::new(&events_path, "run-1"));

        let mut request = PipelineRequest::new(PipelineAction::Generate, "image-pro", "red square");
        request.save_options.enabled = true;
        request.save_options.destination_path = Some("/campaign/".to_string());
        request.analysis_options.enabled = true;
        request.analysis_options.custom_prompt = Some("List the colors.".to_string());
        request.metadata.insert("owner".to_string(), json!("studio"));

        let response = dispatcher.run(&request);
        assert!(response.success, "{:?}", response.steps);
        assert_eq!(response.message, "Pipeline completed");
        assert_eq!(response.steps.len(), 3);

        let save = response.save_result.clone().unwrap_or_default();
        assert_eq!(save.total_saved, 1);
        let saved_path = save.saved[0].path.clone().unwrap_or_default();
        assert!(saved_path.starts_with("campaign/flux-pro_"));
        assert!(saved_path.ends_with(".png"));
        assert!(temp.path().join("media").join(&saved_path).exists());

        let records = store.query_records(&Map::new())?;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(Some(record.id.clone()), save.saved[0].record_id);
        assert_eq!(record.fields["owner"], json!("studio"));
        assert_eq!(record.fields["analysis_prompt"], json!("List the colors."));
        assert_eq!(record.fields["width"], json!(2));
        assert_eq!(record.fields["total_images"], json!(1));
        assert_eq!(record.tags(), vec!["red", "square"]);
        assert_eq!(record.fields["summary"], json!("a red square"));
        assert_eq!(record.fields["products"], json!("None identified"));
        assert_eq!(record.fields["feedback"], json!("Add texture."));
        assert_eq!(record.fields["has_analysis"], json!(true));
        assert!(record.fields.contains_key("analyzed_at"));

        let analysis = response.analysis_result.clone().unwrap_or_default();
        assert_eq!(analysis.total_analyzed, 1);
        assert_eq!(analysis.images[0].record_id, save.saved[0].record_id);

        let prompts = analyzer.prompts.lock().map(|rows| rows.clone()).unwrap_or_default();
        assert_eq!(prompts, vec!["List the colors."]);

        let events = std::fs::read_to_string(&events_path)?;
        let types: Vec<String> = events
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(
            types,
            vec![
                "pipeline_started",
                "task_submitted",
                "stage_finished",
                "stage_finished",
                "stage_finished",
                "pipeline_finished"
            ]
        );
        Ok(())
    }

    #[test]
    fn generate_with_source_image_is_routed_as_edit() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events_path = temp.path().join("events.jsonl");
        let transport = flux_transport("flux-kontext");
        let dispatcher = PipelineDispatcher::new(coordinator(transport.clone()))
            .with_events(EventLog::new(&events_path, "run-2"));
        let mut request = PipelineRequest::new(PipelineAction::Generate, "flux-pro", "add a hat");
        request
            .source_images
            .push(SourceImage::new("ref.png", "image/png", b"hello".to_vec()));

        let response = dispatcher.run(&request);
        assert!(response.success, "{:?}", response.generation_result.error);
        assert_eq!(response.generation_result.model, "flux-kontext");

        let requests = transport.requests();
        assert!(requests[0].url.ends_with("/v1/flux-kontext"));
        let RequestBody::Json(body) = &requests[0].body else {
            anyhow::bail!("expected JSON body");
        };
        assert_eq!(body["image_prompt"], json!("aGVsbG8="));

        let submitted = std::fs::read_to_string(&events_path)?
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .find(|row| row["type"] == json!("task_submitted"))
            .unwrap_or_default();
        assert_eq!(submitted["model"], json!("flux-kontext"));
        assert_eq!(submitted["rerouted_from"], json!("flux-pro"));
        Ok(())
    }

    #[test]
    fn generate_on_edit_model_attaches_source_image() -> anyhow::Result<()> {
        let transport = flux_transport("flux-kontext");
        let dispatcher = PipelineDispatcher::new(coordinator(transport.clone()));
        let mut request = PipelineRequest::new(PipelineAction::Generate, "image-edit", "make it blue");
        request
            .source_images
            .push(SourceImage::new("ref.png", "image/png", b"hello".to_vec()));

        let response = dispatcher.run(&request);
        assert!(response.success, "{:?}", response.generation_result.error);
        assert!(!response.generation_result.message.contains("cannot edit images"));
        let RequestBody::Json(body) = &transport.requests()[0].body else {
            anyhow::bail!("expected JSON body");
        };
        assert_eq!(body["image_prompt"], json!("aGVsbG8="));
        Ok(())
    }

    #[test]
    fn analysis_covers_every_saved_image() -> anyhow::Result<()> {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route(HttpMethod::Post, "/generations/jobs", vec![json_reply(201, json!({"id": "job-1"}))])
                .route(
                    HttpMethod::Get,
                    "/generations/jobs/job-1",
                    vec![json_reply(200, json!({"status": "succeeded", "generations": [{"id": "g1"}, {"id": "g2"}]}))],
                )
                .route(HttpMethod::Get, "/content/video", vec![bytes_reply(200, "image/png", &tiny_png())]),
        );
        let temp = tempfile::tempdir()?;
        let store = Arc::new(FileRecordStore::new(temp.path().join("records.json")));
        let analyzer = Arc::new(FixedAnalyzer {
            prompts: Mutex::new(Vec::new()),
        });
        let dispatcher = PipelineDispatcher::new(coordinator(transport))
            .with_storage(Arc::new(LocalDirStorage::new(temp.path().join("media"))))
            .with_metadata(store.clone())
            .with_analyzer(analyzer.clone());
        let mut request = PipelineRequest::new(PipelineAction::Generate, "video", "two stills");
        request.params.n_variants = Some(2);
        request.save_options.enabled = true;
        request.save_options.save_all = true;
        request.analysis_options.enabled = true;

        let response = dispatcher.run(&request);
        assert!(response.success, "{:?}", response.steps);
        let save = response.save_result.clone().unwrap_or_default();
        assert_eq!(save.total_saved, 2);

        let analysis = response.analysis_result.clone().unwrap_or_default();
        assert_eq!(analysis.total_analyzed, 2);
        let indices: Vec<usize> = analysis.images.iter().map(|row| row.index).collect();
        assert_eq!(indices, vec![0, 1]);
        assert_eq!(analyzer.prompts.lock().map(|rows| rows.len()).unwrap_or_default(), 2);
        assert_eq!(response.steps[2].message, "Analyzed 2 image(s)");

        let records = store.query_records(&Map::new())?;
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.fields["has_analysis"], json!(true));
            assert_eq!(record.fields["summary"], json!("a red square"));
            assert_eq!(record.tags(), vec!["red", "square"]);
        }
        Ok(())
    }

    #[test]
    fn save_first_only_and_metadata_failure_is_not_fatal() -> anyhow::Result<()> {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route(HttpMethod::Post, "/generations/jobs", vec![json_reply(201, json!({"id": "job-1"}))])
                .route(
                    HttpMethod::Get,
                    "/generations/jobs/job-1",
                    vec![json_reply(200, json!({"status": "succeeded", "generations": [{"id": "g1"}, {"id": "g2"}]}))],
                )
                .route(HttpMethod::Get, "/content/video", vec![bytes_reply(200, "video/mp4", b"mp4")]),
        );
        let temp = tempfile::tempdir()?;
        let dispatcher = PipelineDispatcher::new(coordinator(transport))
            .with_storage(Arc::new(LocalDirStorage::new(temp.path())))
            .with_metadata(Arc::new(FailingStore));
        let mut request = PipelineRequest::new(PipelineAction::Generate, "video", "waves");
        request.params.n_variants = Some(2);
        request.save_options.enabled = true;
        request.save_options.save_all = false;

        let response = dispatcher.run(&request);
        assert_eq!(response.generation_result.artifacts.len(), 2);
        let save = response.save_result.clone().unwrap_or_default();
        assert!(save.success);
        assert_eq!(save.saved.len(), 1);
        assert!(save.saved[0].record_id.is_none());
        assert!(save.saved[0].path.as_deref().unwrap_or("").ends_with(".mp4"));
        Ok(())
    }

    #[test]
    fn unknown_model_and_missing_collaborators() {
        let transport = Arc::new(ScriptedTransport::new());
        let dispatcher = PipelineDispatcher::new(coordinator(transport.clone()));
        let response = dispatcher.run(&PipelineRequest::new(PipelineAction::Generate, "dall-e", "cat"));
        assert!(!response.generation_result.success);
        assert!(response.generation_result.message.contains("unknown model 'dall-e'"));
        assert!(transport.requests().is_empty());

        let dispatcher = PipelineDispatcher::new(coordinator(flux_transport("flux-pro")));
        let mut request = PipelineRequest::new(PipelineAction::Generate, "flux-pro", "cat");
        request.save_options.enabled = true;
        request.analysis_options.enabled = true;
        let response = dispatcher.run(&request);
        assert!(response.generation_result.success);
        let save_error = response
            .save_result
            .and_then(|row| row.error)
            .map(|error| error.message)
            .unwrap_or_default();
        assert_eq!(save_error, "save failed: no object storage configured");
        let analysis_error = response
            .analysis_result
            .and_then(|row| row.error)
            .map(|error| error.message)
            .unwrap_or_default();
        assert_eq!(analysis_error, "analysis failed: no vision analyzer configured");
    }

    #[test]
    fn storage_trait_object_accepts_local_dir() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let storage: Arc<dyn ObjectStorage> = Arc::new(LocalDirStorage::new(temp.path()));
        assert!(storage.upload(b"x", "a/b.png")?.ends_with("a/b.png"));
        Ok(())
    }
}
