//! End-to-end tests through the controller, pumped from an async tick loop.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use llama_session::config::Config;
use llama_session::inference::stub::{StubBackend, StubConfig};
use llama_session::session::{
    ConversationController, ErrorCode, GenerationSummary, ModelLifecycle, Role, StopReason,
};
use tempfile::NamedTempFile;

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Loaded,
    Prompt(Role, usize),
    Started,
    Token(String),
    Complete(GenerationSummary),
    Reset,
    Error(ErrorCode),
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<Seen>>>);

impl Recorder {
    fn events(&self) -> Vec<Seen> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, pred: impl Fn(&Seen) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    fn completions(&self) -> Vec<GenerationSummary> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Seen::Complete(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    fn attach(&self, controller: &mut ConversationController) {
        let r = self.0.clone();
        let callbacks = controller.callbacks_mut();
        {
            let r = r.clone();
            callbacks.on_model_loaded(move |_| r.lock().unwrap().push(Seen::Loaded));
        }
        {
            let r = r.clone();
            callbacks.on_prompt_processed(move |n, role, _| {
                r.lock().unwrap().push(Seen::Prompt(role, n))
            });
        }
        {
            let r = r.clone();
            callbacks.on_generation_started(move || r.lock().unwrap().push(Seen::Started));
        }
        {
            let r = r.clone();
            callbacks.on_token(move |t| r.lock().unwrap().push(Seen::Token(t.to_string())));
        }
        {
            let r = r.clone();
            callbacks.on_generation_complete(move |s| {
                r.lock().unwrap().push(Seen::Complete(s.clone()))
            });
        }
        {
            let r = r.clone();
            callbacks.on_context_reset(move || r.lock().unwrap().push(Seen::Reset));
        }
        callbacks.on_error(move |_, code| r.lock().unwrap().push(Seen::Error(code)));
    }
}

fn setup(stub: StubConfig) -> (ConversationController, Recorder, NamedTempFile) {
    let model = NamedTempFile::new().unwrap();
    let mut config = Config::default();
    config.model.model_path = model.path().to_path_buf();
    config.model.context_size = 2048;
    config.sampling.temperature = 0.0;

    let mut controller =
        ConversationController::new(Box::new(StubBackend::new(stub)), config).unwrap();
    let recorder = Recorder::default();
    recorder.attach(&mut controller);
    (controller, recorder, model)
}

/// Pump the foreground until `done` holds.
async fn pump_until(controller: &mut ConversationController, done: impl Fn() -> bool) {
    let start = Instant::now();
    let mut tick = tokio::time::interval(Duration::from_millis(2));
    loop {
        tick.tick().await;
        controller.poll();
        if done() {
            return;
        }
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for session");
    }
}

/// Wait for every queued task up to `task` to be delivered, and for the
/// generation slot to be released.
async fn settle(controller: &mut ConversationController, task: u64) {
    let start = Instant::now();
    loop {
        let idle = !controller.is_generating();
        controller.poll();
        if idle && controller.completed_task_id() >= task {
            // Anything enqueued before the slot was released is delivered now.
            controller.poll();
            return;
        }
        assert!(start.elapsed() < TIMEOUT, "timed out waiting for session");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

#[tokio::test]
async fn test_system_then_user_scenario() {
    let (mut controller, rec, _model) =
        setup(StubConfig::default().with_reply("Hello! Nice to meet you."));

    controller.load_model().unwrap();
    controller
        .insert_prompt("You are a helpful assistant.", Role::System, false, false)
        .unwrap();
    let task = controller
        .insert_prompt("Hello", Role::User, true, true)
        .unwrap();
    settle(&mut controller, task).await;

    let events = rec.events();
    let prompts: Vec<Role> = events
        .iter()
        .filter_map(|e| match e {
            Seen::Prompt(role, _) => Some(*role),
            _ => None,
        })
        .collect();
    assert_eq!(prompts, vec![Role::System, Role::User]);

    let user_prompt = events
        .iter()
        .position(|e| matches!(e, Seen::Prompt(Role::User, _)))
        .unwrap();
    let first_token = events
        .iter()
        .position(|e| matches!(e, Seen::Token(_)))
        .unwrap();
    assert!(user_prompt < first_token);
    assert!(rec.count(|e| matches!(e, Seen::Token(_))) >= 1);

    let completions = rec.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].response, "Hello! Nice to meet you.");
    assert!(completions[0].tokens_per_second > 0.0);

    // Snapshot published with the final state.
    let history = controller.structured_history();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].role, Role::Assistant);
    assert_eq!(controller.state().lifecycle, ModelLifecycle::Idle);
    assert_eq!(
        controller.state().committed_length + "<|im_end|>\n".len(),
        controller.raw_context_history().len()
    );
    assert!(!controller.is_generating());
}

#[tokio::test]
async fn test_concurrent_prompt_is_rejected() {
    let stub = StubConfig::default()
        .with_reply("streaming ")
        .repeating()
        .with_token_delay(Duration::from_millis(2));
    let (mut controller, rec, _model) = setup(stub);

    controller.load_model().unwrap();
    let first = controller
        .insert_prompt("Tell me a story", Role::User, true, true)
        .unwrap();
    assert!(controller.is_generating());

    let err = controller
        .insert_prompt("Interrupting", Role::User, true, true)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidOperation);
    // Rejections are reported synchronously.
    assert_eq!(rec.count(|e| *e == Seen::Error(ErrorCode::InvalidOperation)), 1);

    let r = rec.clone();
    pump_until(&mut controller, move || {
        r.count(|e| matches!(e, Seen::Token(_))) >= 3
    })
    .await;
    controller.stop_generation();

    settle(&mut controller, first).await;

    assert_eq!(rec.completions().len(), 1);
    assert_eq!(controller.completed_task_id(), first);
    let history = controller.structured_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "Tell me a story");
    assert!(!controller.is_generating());
}

#[tokio::test]
async fn test_stop_keeps_partial_reply() {
    let stub = StubConfig::default()
        .with_reply("la ")
        .repeating()
        .with_token_delay(Duration::from_millis(2));
    let (mut controller, rec, _model) = setup(stub);

    controller.load_model().unwrap();
    controller
        .insert_prompt("Sing", Role::User, true, true)
        .unwrap();

    let r = rec.clone();
    pump_until(&mut controller, move || {
        r.count(|e| matches!(e, Seen::Token(_))) >= 5
    })
    .await;
    controller.stop_generation();
    controller.stop_generation();

    let r = rec.clone();
    pump_until(&mut controller, move || !r.completions().is_empty()).await;

    let summary = &rec.completions()[0];
    assert_eq!(summary.stop_reason, StopReason::Stopped);
    assert!(summary.token_count >= 5);
    assert!(summary.response.starts_with("la la"));

    let streamed: String = rec
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Seen::Token(t) => Some(t),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, summary.response);
}

#[tokio::test]
async fn test_resume_after_stop() {
    let stub = StubConfig::default()
        .with_reply("one two three four five six seven eight")
        .with_token_delay(Duration::from_millis(5));
    let (mut controller, rec, _model) = setup(stub);

    controller.load_model().unwrap();
    let first = controller
        .insert_prompt("Count", Role::User, true, true)
        .unwrap();
    let r = rec.clone();
    pump_until(&mut controller, move || {
        r.count(|e| matches!(e, Seen::Token(_))) >= 3
    })
    .await;
    controller.stop_generation();
    settle(&mut controller, first).await;
    assert_eq!(rec.completions().len(), 1);

    let resumed = controller.resume_generation().unwrap();
    settle(&mut controller, resumed).await;

    let completions = rec.completions();
    assert_eq!(completions[1].stop_reason, StopReason::EndOfGeneration);
    let history = controller.structured_history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "one two three four five six seven eight");
}

#[tokio::test]
async fn test_reset_clears_context() {
    let (mut controller, rec, _model) = setup(StubConfig::default());

    controller.load_model().unwrap();
    controller
        .insert_prompt("Hello", Role::User, true, true)
        .unwrap();
    let task = controller.reset_context_history(false).unwrap();
    settle(&mut controller, task).await;

    assert_eq!(rec.count(|e| *e == Seen::Reset), 1);
    let state = controller.state();
    assert!(state.chat_history.is_empty());
    assert!(state.context_history.is_empty());
    assert_eq!(state.committed_length, 0);
    assert_eq!(state.context_used, 0);
}

#[tokio::test]
async fn test_undo_sequence_empties_history() {
    let (mut controller, rec, _model) = setup(StubConfig::default().with_reply("Hi."));

    controller.load_model().unwrap();
    controller
        .insert_prompt("Hello", Role::User, true, true)
        .unwrap();
    controller.remove_last_reply().unwrap();
    let last = controller.remove_last_user_input().unwrap();
    settle(&mut controller, last).await;

    assert!(controller.structured_history().is_empty());
    assert_eq!(controller.state().committed_length, 0);
    assert_eq!(controller.state().context_used, 0);
    assert_eq!(rec.completions().len(), 1);
}

#[tokio::test]
async fn test_prompt_before_load_is_rejected() {
    let (mut controller, rec, _model) = setup(StubConfig::default());
    let err = controller
        .insert_prompt("Hello", Role::User, true, true)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidOperation);
    assert_eq!(rec.events(), vec![Seen::Error(ErrorCode::InvalidOperation)]);
    assert!(!controller.is_generating());
}

#[tokio::test]
async fn test_failed_load_reports_error() {
    let (mut controller, rec, _model) = setup(StubConfig::default());
    controller.config_mut().model.model_path = "/nonexistent/model.gguf".into();
    controller.load_model().unwrap();

    let r = rec.clone();
    pump_until(&mut controller, move || {
        r.count(|e| *e == Seen::Error(ErrorCode::ModelLoadFailure)) == 1
    })
    .await;
    assert!(!controller.is_loaded());
    assert_eq!(rec.count(|e| *e == Seen::Loaded), 0);

    let err = controller
        .insert_prompt("Hello", Role::User, true, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidOperation);
}

#[tokio::test]
async fn test_shutdown_mid_generation() {
    let stub = StubConfig::default()
        .with_reply("forever ")
        .repeating()
        .with_token_delay(Duration::from_millis(2));
    let (mut controller, rec, _model) = setup(stub);

    controller.load_model().unwrap();
    controller
        .insert_prompt("Go", Role::User, true, true)
        .unwrap();
    let r = rec.clone();
    pump_until(&mut controller, move || {
        r.count(|e| matches!(e, Seen::Token(_))) >= 1
    })
    .await;

    controller.shutdown();

    let completions = rec.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].stop_reason, StopReason::Stopped);
    assert!(controller.insert_prompt("More", Role::User, true, true).is_err());
}

#[tokio::test]
async fn test_wrap_prompt_preview() {
    let (mut controller, rec, _model) = setup(StubConfig::default());

    let err = controller
        .wrap_prompt_for_role("Hi", Role::User, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidOperation);

    let task = controller.load_model().unwrap();
    settle(&mut controller, task).await;
    assert_eq!(rec.count(|e| *e == Seen::Loaded), 1);

    let wrapped = controller
        .wrap_prompt_for_role("Hi", Role::User, true)
        .unwrap();
    assert_eq!(wrapped, "<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n");
    assert!(controller.structured_history().is_empty());
    assert_eq!(controller.state().context_used, 0);
}

#[tokio::test]
async fn test_stop_sequence_through_controller() {
    let (mut controller, rec, _model) =
        setup(StubConfig::default().with_reply("Done. ### then more"));
    controller.config_mut().chat.stop_sequences = vec!["###".to_string()];

    controller.load_model().unwrap();
    let task = controller
        .insert_prompt("Go", Role::User, true, true)
        .unwrap();
    settle(&mut controller, task).await;

    let completions = rec.completions();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].stop_reason, StopReason::StopSequence);
    assert_eq!(completions[0].response, "Done. ###");
}
