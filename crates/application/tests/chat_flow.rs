//! End-to-end chat flow through `AssistantServices` with a scripted engine.

use async_trait::async_trait;
use futures::StreamExt;
use ndis_application::{
    AppConfig, AssistantServices, ChatError, ChildProfile, Redirect, SubmissionFailure,
    SubmissionOutcome, TemplateError, ValidationError, CONVERSATIONS_KEY,
};
use ndis_conversation::{ConversationSnapshot, Role};
use ndis_engine::scripted::ScriptedLoader;
use ndis_engine::{EngineRegistry, InferenceParameters};
use ndis_events::{event_names, AssistantEvent, InMemoryEventBus, SubmissionSignal};
use ndis_models::{default_catalog, ArtifactBody, ArtifactFetcher, ModelError, ModelState};
use ndis_storage::{KeyValueStore, KeyValueStoreExt, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Serves the same in-memory bytes for every URL.
struct StaticFetcher {
    chunks: Vec<Vec<u8>>,
}

#[async_trait]
impl ArtifactFetcher for StaticFetcher {
    async fn fetch(&self, _url: &str) -> ndis_models::Result<ArtifactBody> {
        let total = self.chunks.iter().map(|c| c.len() as u64).sum();
        let chunks = futures::stream::iter(self.chunks.clone().into_iter().map(Ok)).boxed();
        Ok(ArtifactBody {
            total_bytes: Some(total),
            chunks,
        })
    }
}

struct Harness {
    dir: TempDir,
    persistence: Arc<dyn KeyValueStore>,
    bus: Arc<InMemoryEventBus>,
    loader: ScriptedLoader,
    services: AssistantServices,
}

fn model_id() -> String {
    default_catalog()[0].id.clone()
}

fn build(dir: TempDir, persistence: Arc<dyn KeyValueStore>, loader: ScriptedLoader) -> Harness {
    let bus = Arc::new(InMemoryEventBus::new());
    let mut registry = EngineRegistry::new();
    registry.register(Arc::new(loader.clone()));
    let services = AssistantServices::new(
        AppConfig::with_data_dir(dir.path()),
        persistence.clone(),
        bus.clone(),
        Arc::new(StaticFetcher {
            chunks: vec![b"GGUF".to_vec(), b"data".to_vec()],
        }),
        registry,
    );
    Harness {
        dir,
        persistence,
        bus,
        loader,
        services,
    }
}

/// Harness with the first built-in model on disk.
fn harness(loader: ScriptedLoader) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let model = &default_catalog()[0];
    let model_dir = AppConfig::with_data_dir(dir.path()).models_dir().join(&model.id);
    std::fs::create_dir_all(&model_dir).unwrap();
    std::fs::write(model_dir.join(model.filename()), b"GGUF").unwrap();
    build(dir, Arc::new(MemoryStore::new()), loader)
}

async fn loaded_harness(loader: ScriptedLoader) -> Harness {
    let h = harness(loader);
    h.services.engine.load_model(&model_id()).await.unwrap();
    h
}

fn profile() -> ChildProfile {
    ChildProfile {
        name: "Mia".to_string(),
        age: 6,
        gender: "Female".to_string(),
        general_background: "Lives with both parents.".to_string(),
        functional_assessment: "Delayed expressive language.".to_string(),
        ndis_plan: "Capacity building: speech therapy 40 hours.".to_string(),
        other_information: String::new(),
    }
}

fn message_updates(bus: &InMemoryEventBus) -> Vec<String> {
    bus.events_for(event_names::MESSAGE_UPDATED)
        .into_iter()
        .filter_map(|e| match e {
            AssistantEvent::MessageUpdated { content, .. } => Some(content),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_first_submission_streams_into_new_conversation() {
    let h = loaded_harness(ScriptedLoader::chars("Hello world")).await;

    let outcome = h.services.chat.submit(None, "Hello", &profile()).await.unwrap();

    let SubmissionOutcome::Completed {
        conversation_id,
        message_id,
        content,
    } = outcome
    else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(content, "Hello world");

    let conversation = h.services.conversations.get_conversation_by_id(conversation_id).unwrap();
    let messages = conversation.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role(), Role::User);
    assert_eq!(messages[0].content(), "Hello");
    assert_eq!(messages[1].id(), message_id);
    assert_eq!(messages[1].role(), Role::Assistant);
    assert_eq!(messages[1].content(), "Hello world");

    let updates = message_updates(&h.bus);
    assert_eq!(updates.len(), 11);
    assert_eq!(updates[0], "H");
    assert_eq!(updates[1], "He");
    assert_eq!(updates.last().unwrap(), "Hello world");
    assert!(!h.services.completion.is_generating());

    let finished = h.bus.events_for(event_names::SUBMISSION_FINISHED);
    assert_eq!(
        finished,
        vec![AssistantEvent::SubmissionFinished {
            conversation_id: conversation_id.0,
            outcome: SubmissionSignal::Completed,
        }]
    );
}

#[tokio::test]
async fn test_prompt_contains_profile_and_history() {
    let h = loaded_harness(ScriptedLoader::new(vec!["Sure."])).await;

    let first = h.services.chat.submit(None, "What is core funding?", &profile()).await.unwrap();
    let id = first.conversation_id();
    h.services.chat.submit(Some(id), "And capacity building?", &profile()).await.unwrap();

    let prompts = h.loader.prompts();
    assert_eq!(prompts.len(), 2);
    let second = &prompts[1];
    assert!(second.starts_with("<|im_start|>system\nYou are a helpful assistant for parents"));
    assert!(second.contains("- Name: Mia\n- Age: 6\n- Gender: Female"));
    assert!(second.contains("General Background:\nLives with both parents."));
    assert!(!second.contains("Other Information:"));
    assert!(second.contains("<|im_start|>user\nWhat is core funding?<|im_end|>\n<|im_start|>assistant\nSure.<|im_end|>\n"));
    assert!(second.ends_with("<|im_start|>user\nAnd capacity building?<|im_end|>\n<|im_start|>assistant\n"));

    let conversation = h.services.conversations.get_conversation_by_id(id).unwrap();
    assert_eq!(conversation.messages().len(), 4);
    assert_eq!(h.services.conversations.len(), 1);
}

#[tokio::test]
async fn test_incomplete_profile_is_rejected_without_mutation() {
    let h = loaded_harness(ScriptedLoader::chars("unused")).await;
    let mut incomplete = profile();
    incomplete.age = 0;

    let err = h.services.chat.submit(None, "Hello", &incomplete).await.unwrap_err();
    match err {
        ChatError::Validation(ref v) => {
            assert!(matches!(v, ValidationError::ProfileIncomplete(missing) if missing == &vec!["age"]));
            assert_eq!(v.redirect(), Some(Redirect::Profile));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(h.services.conversations.is_empty());
    assert_eq!(h.loader.generations(), 0);
    assert!(h.bus.events_for(event_names::SUBMISSION_FINISHED).is_empty());
}

#[tokio::test]
async fn test_missing_model_redirects_to_model_screen() {
    let h = harness(ScriptedLoader::chars("unused"));

    let err = h.services.chat.submit(None, "Hello", &profile()).await.unwrap_err();
    let ChatError::Validation(v) = err else {
        panic!("expected validation error");
    };
    assert_eq!(v, ValidationError::NoModelLoaded);
    assert_eq!(v.redirect(), Some(Redirect::Model));
    assert!(h.services.conversations.is_empty());
}

#[tokio::test]
async fn test_unknown_conversation_is_rejected() {
    let h = loaded_harness(ScriptedLoader::chars("x")).await;
    let err = h
        .services
        .chat
        .submit(Some(ndis_conversation::ConversationId(42)), "Hello", &profile())
        .await
        .unwrap_err();
    assert!(matches!(err, ChatError::Conversation(_)));
    assert!(h.services.conversations.is_empty());
}

#[tokio::test]
async fn test_stop_keeps_last_delivered_content() {
    let h = loaded_harness(
        ScriptedLoader::chars("abcdefghij").with_step_delay(Duration::from_millis(25)),
    )
    .await;
    let p = profile();

    let submit = h.services.chat.submit(None, "Hi", &p);
    let stopper = async {
        while message_updates(&h.bus).len() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(h.services.chat.stop());
    };
    let (outcome, ()) = tokio::join!(submit, stopper);
    let outcome = outcome.unwrap();

    assert!(matches!(outcome, SubmissionOutcome::Cancelled { .. }));
    assert_eq!(outcome.content(), "ab");
    assert_eq!(message_updates(&h.bus), vec!["a", "ab"]);
    assert!(!h.services.completion.is_generating());

    let conversation = h
        .services
        .conversations
        .get_conversation_by_id(outcome.conversation_id())
        .unwrap();
    assert_eq!(conversation.message(outcome.message_id()).unwrap().content(), "ab");
}

#[tokio::test]
async fn test_engine_failure_preserves_partial_content() {
    let h = loaded_harness(ScriptedLoader::chars("abcdef").failing_at(2, "decode error")).await;

    let outcome = h.services.chat.submit(None, "Hi", &profile()).await.unwrap();
    let SubmissionOutcome::Failed {
        conversation_id,
        message_id,
        content,
        error,
    } = outcome
    else {
        panic!("expected failure");
    };
    assert_eq!(content, "ab");
    assert!(matches!(error, SubmissionFailure::Engine(_)));

    let conversation = h.services.conversations.get_conversation_by_id(conversation_id).unwrap();
    assert_eq!(conversation.message(message_id).unwrap().content(), "ab");
    assert!(!h.services.completion.is_generating());
}

#[tokio::test]
async fn test_template_failure_keeps_appended_messages() {
    let h = loaded_harness(ScriptedLoader::chars("never").with_template(None)).await;

    let outcome = h.services.chat.submit(None, "Hi", &profile()).await.unwrap();
    let SubmissionOutcome::Failed {
        conversation_id,
        error,
        ..
    } = outcome
    else {
        panic!("expected failure");
    };
    assert!(matches!(
        error,
        SubmissionFailure::Template(TemplateError::MissingTemplate)
    ));
    assert_eq!(h.loader.generations(), 0);

    let conversation = h.services.conversations.get_conversation_by_id(conversation_id).unwrap();
    assert_eq!(conversation.messages().len(), 2);
    assert_eq!(conversation.messages()[1].content(), "");
}

#[tokio::test]
async fn test_model_rendered_template_is_used_for_unknown_families() {
    let h = loaded_harness(
        ScriptedLoader::chars("ok")
            .with_template(Some("{{ '<|USER|>' + message['content'] }}"))
            .rendering_natively(),
    )
    .await;

    let outcome = h.services.chat.submit(None, "Hi", &profile()).await.unwrap();
    assert!(matches!(outcome, SubmissionOutcome::Completed { .. }));
    assert_eq!(outcome.content(), "ok");

    let prompts = h.loader.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].starts_with("system: "));
    assert!(prompts[0].ends_with("user: Hi\nassistant: "));
}

#[tokio::test]
async fn test_unload_during_submission_cancels_it() {
    let h = loaded_harness(
        ScriptedLoader::new(vec!["word "; 500]).with_step_delay(Duration::from_millis(10)),
    )
    .await;
    let p = profile();

    let submit = h.services.chat.submit(None, "Hi", &p);
    let unload = async {
        while message_updates(&h.bus).is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        h.services.engine.unload_model().await.unwrap();
    };
    let (outcome, ()) = tokio::join!(submit, unload);

    assert!(matches!(outcome.unwrap(), SubmissionOutcome::Cancelled { .. }));
    assert!(h.services.engine.loaded_model().is_none());
    assert_eq!(
        h.services.catalog.get(&model_id()).unwrap().state(),
        ModelState::Ready
    );
    assert_eq!(h.loader.releases(), 1);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let h = loaded_harness(ScriptedLoader::new(vec!["Noted."])).await;
    h.services.profile.replace(profile()).unwrap();
    let outcome = h.services.chat.submit(None, "Remember this", &profile()).await.unwrap();
    let custom = h
        .services
        .add_custom_model("https://huggingface.co/org/repo/resolve/main/extra-model.gguf")
        .unwrap();
    h.services
        .set_params(InferenceParameters {
            temperature: 0.7,
            ..InferenceParameters::default()
        })
        .unwrap();

    let snapshot: ConversationSnapshot =
        h.persistence.load(CONVERSATIONS_KEY, ConversationSnapshot::default());
    assert_eq!(snapshot.conversations.len(), 1);

    let Harness {
        dir, persistence, ..
    } = h;
    let restarted = build(dir, persistence, ScriptedLoader::chars("x"));

    let conversation = restarted
        .services
        .conversations
        .get_conversation_by_id(outcome.conversation_id())
        .unwrap();
    assert_eq!(conversation.messages()[1].content(), "Noted.");
    assert!(restarted.services.profile.has_profile());
    assert_eq!(restarted.services.engine.params().temperature, 0.7);

    let restored = restarted.services.catalog.get(&custom.id).unwrap();
    assert!(restored.custom);
    assert_eq!(restored.state(), ModelState::NotDownloaded);
    assert_eq!(
        restarted.services.catalog.get(&model_id()).unwrap().state(),
        ModelState::Ready
    );
}

#[tokio::test]
async fn test_download_then_load_custom_model() {
    let h = harness(ScriptedLoader::chars("ok"));
    let custom = h
        .services
        .add_custom_model("https://example.com/models/tiny-chat.gguf")
        .unwrap();
    assert_eq!(custom.state(), ModelState::NotDownloaded);
    assert_eq!(custom.download_percent(), 0.0);

    let mut download = h.services.downloader.start_download(&custom.id).unwrap();
    let mut percents = Vec::new();
    while let Some(p) = download.progress.next().await {
        percents.push(p);
    }
    download.wait().await.unwrap();
    assert_eq!(percents, vec![0.5, 1.0]);

    let model = h.services.catalog.get(&custom.id).unwrap();
    assert_eq!(model.state(), ModelState::Ready);
    assert_eq!(model.download_percent(), 1.0);

    h.services.engine.load_model(&custom.id).await.unwrap();
    let err = h.services.engine.load_model(&model_id()).await.unwrap_err();
    assert!(matches!(err, ndis_engine::EngineError::AlreadyLoaded(_)));
    assert_eq!(h.services.catalog.get(&model_id()).unwrap().state(), ModelState::Ready);
}

#[tokio::test]
async fn test_duplicate_custom_model_is_rejected() {
    let h = harness(ScriptedLoader::chars("ok"));
    let url = "https://example.com/models/tiny-chat.gguf";
    h.services.add_custom_model(url).unwrap();
    let err = h.services.add_custom_model(url).unwrap_err();
    assert!(matches!(
        err,
        ndis_application::ServiceError::Model(ModelError::Duplicate(_))
    ));
}

#[test]
fn test_harness_uses_temp_dir() {
    let h = harness(ScriptedLoader::chars("ok"));
    assert!(h.services.config.models_dir().starts_with(h.dir.path()));
}
