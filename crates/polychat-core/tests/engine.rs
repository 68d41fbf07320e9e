//! End-to-end turns through the engine with a scripted stream source:
//! submit, stream, reconcile, and the durable list the presentation
//! layer would read.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use polychat_core::services::stream_source::{
    CancelHandle, FanoutRequest, OpenError, OpenedStream, ResponseStream, StreamChunk,
    StreamRequest, StreamSource,
};
use polychat_core::{ChatEngine, EngineConfig, InMemoryRepository, Role};

/// What the next opened stream should do.
enum Script {
    /// Emit the chunks, then end.
    Emit(Vec<StreamChunk>),
    /// Emit the chunks, then stay open until cancelled.
    EmitThenHang(Vec<StreamChunk>),
    /// Refuse to open with the given HTTP status.
    FailOpen(u16),
}

/// Stream source whose responses are scripted per open call, in order.
struct ScriptedSource {
    scripts: Mutex<VecDeque<Script>>,
}

impl ScriptedSource {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
        })
    }

    fn next_script(&self) -> Script {
        self.scripts
            .lock()
            .pop_front()
            .expect("more streams opened than scripted")
    }
}

fn play(script: Script) -> Result<OpenedStream, OpenError> {
    match script {
        Script::FailOpen(status) => Err(OpenError::Status(status)),
        Script::Emit(chunks) => {
            let stream: ResponseStream =
                Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)));
            Ok(OpenedStream {
                chunks: stream,
                cancel: CancelHandle::new(),
            })
        }
        Script::EmitThenHang(chunks) => {
            let cancel = CancelHandle::new();
            let flag = cancel.clone();
            let stream: ResponseStream = Box::pin(async_stream::stream! {
                for chunk in chunks {
                    yield Ok(chunk);
                }
                // Stalled connection: nothing more ever arrives, so only
                // cancellation can end the stream.
                flag.cancelled().await;
            });
            Ok(OpenedStream {
                chunks: stream,
                cancel,
            })
        }
    }
}

impl StreamSource for ScriptedSource {
    fn open(&self, _request: StreamRequest) -> BoxFuture<'static, Result<OpenedStream, OpenError>> {
        let script = self.next_script();
        Box::pin(async move { play(script) })
    }

    fn open_fanout(
        &self,
        _request: FanoutRequest,
    ) -> BoxFuture<'static, Result<OpenedStream, OpenError>> {
        let script = self.next_script();
        Box::pin(async move { play(script) })
    }
}

fn text(s: &str) -> StreamChunk {
    StreamChunk::Text(s.to_string())
}

fn tagged(model: &str, s: &str) -> StreamChunk {
    StreamChunk::TaggedText {
        model: model.to_string(),
        text: s.to_string(),
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        // Fold every chunk so assertions never race the throttle.
        throttle_interval: Duration::ZERO,
        flush_debounce: Duration::from_millis(10),
    }
}

async fn engine_with(scripts: Vec<Script>) -> ChatEngine {
    ChatEngine::new(
        ScriptedSource::new(scripts),
        Arc::new(InMemoryRepository::new()),
        test_config(),
    )
    .await
    .expect("engine should start with an empty repository")
}

async fn wait_idle(engine: &ChatEngine, conv_id: &str) {
    for _ in 0..400 {
        if !engine.is_streaming(conv_id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("stream did not finish within 2s");
}

#[tokio::test]
async fn full_turn_lands_in_the_durable_list() {
    let engine = engine_with(vec![Script::Emit(vec![
        text("He"),
        text("llo!"),
        StreamChunk::Done,
    ])])
    .await;

    let (conv_id, request) = engine
        .send_message(None, "Say hello", &["alpha".into()])
        .await
        .unwrap();
    assert!(request.is_some());
    wait_idle(&engine, &conv_id).await;

    let store = engine.store();
    let store = store.lock();
    let conv = store.get(&conv_id).unwrap();
    assert_eq!(conv.title(), "Say hello");
    let msgs = conv.messages();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].role, Role::User);
    assert_eq!(msgs[0].content, "Say hello");
    assert_eq!(msgs[1].role, Role::Assistant);
    assert_eq!(msgs[1].content, "Hello!");
    assert!(!msgs[1].is_error);
}

#[tokio::test]
async fn open_failure_keeps_the_user_turn_and_records_an_error() {
    let engine = engine_with(vec![Script::FailOpen(503)]).await;

    let (conv_id, _) = engine
        .send_message(None, "anyone there?", &["alpha".into()])
        .await
        .unwrap();
    wait_idle(&engine, &conv_id).await;

    let store = engine.store();
    let store = store.lock();
    let msgs = store.get(&conv_id).unwrap().messages();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].content, "anyone there?");
    assert!(!msgs[0].is_error);
    assert!(msgs[1].is_error);
    assert!(msgs[1].content.contains("503"));
}

#[tokio::test]
async fn midstream_error_preserves_partial_content() {
    let engine = engine_with(vec![Script::Emit(vec![
        text("partial answ"),
        StreamChunk::Error("connection reset".into()),
    ])])
    .await;

    let (conv_id, _) = engine
        .send_message(None, "tell me more", &["alpha".into()])
        .await
        .unwrap();
    wait_idle(&engine, &conv_id).await;

    let store = engine.store();
    let store = store.lock();
    let msgs = store.get(&conv_id).unwrap().messages();
    assert_eq!(msgs.len(), 3);
    assert_eq!(msgs[1].content, "partial answ");
    assert!(!msgs[1].is_error);
    assert!(msgs[2].is_error);
    assert_eq!(msgs[2].content, "connection reset");
}

#[tokio::test]
async fn fanout_folds_each_model_into_its_own_message() {
    let engine = engine_with(vec![Script::Emit(vec![
        tagged("alpha", "from alpha"),
        tagged("beta", "from "),
        tagged("beta", "beta"),
        StreamChunk::Done,
    ])])
    .await;

    let (conv_id, _) = engine
        .send_message(None, "compare these", &["alpha".into(), "beta".into()])
        .await
        .unwrap();
    wait_idle(&engine, &conv_id).await;

    let store = engine.store();
    let store = store.lock();
    let msgs = store.get(&conv_id).unwrap().messages();
    assert_eq!(msgs.len(), 3);
    assert_eq!(msgs[1].content, "from alpha");
    assert_eq!(msgs[2].content, "[beta]\nfrom beta");
}

#[tokio::test]
async fn stop_keeps_already_streamed_content() {
    let engine = engine_with(vec![Script::EmitThenHang(vec![text("so far so good")])]).await;

    let (conv_id, _) = engine
        .send_message(None, "go on forever", &["alpha".into()])
        .await
        .unwrap();

    // Wait for the partial content to reach the durable list, then cancel.
    let store = engine.store();
    for _ in 0..400 {
        let has_partial = store
            .lock()
            .get(&conv_id)
            .map(|c| c.messages().len() == 2)
            .unwrap_or(false);
        if has_partial {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.stop(&conv_id);
    wait_idle(&engine, &conv_id).await;

    let store = store.lock();
    let msgs = store.get(&conv_id).unwrap().messages();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[1].content, "so far so good");
    assert!(!msgs[1].is_error);
}

#[tokio::test]
async fn stop_terminates_a_stream_that_never_produces_a_byte() {
    let engine = engine_with(vec![Script::EmitThenHang(vec![])]).await;

    let (conv_id, _) = engine
        .send_message(None, "anyone home?", &["alpha".into()])
        .await
        .unwrap();
    assert!(engine.is_streaming(&conv_id));

    engine.stop(&conv_id);
    wait_idle(&engine, &conv_id).await;

    // No partial content ever arrived: the user turn stands alone, with
    // no error marker and no leaked request entry.
    let store = engine.store();
    let store = store.lock();
    let msgs = store.get(&conv_id).unwrap().messages();
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].content, "anyone home?");
    assert!(!msgs[0].is_error);
    assert!(!engine.has_active_requests());
}

#[tokio::test]
async fn duplicate_submission_is_skipped() {
    let engine = engine_with(vec![Script::Emit(vec![text("hi"), StreamChunk::Done])]).await;

    let (conv_id, first) = engine
        .submit(None, "hello", 42, &["alpha".into()])
        .await
        .unwrap();
    assert!(first.is_some());
    wait_idle(&engine, &conv_id).await;

    // Same content, same submission instant: skipped, nothing dispatched.
    let (same_conv, second) = engine
        .submit(Some(&conv_id), "hello", 42, &["alpha".into()])
        .await
        .unwrap();
    assert_eq!(same_conv, conv_id);
    assert!(second.is_none());

    let store = engine.store();
    let store = store.lock();
    assert_eq!(store.get(&conv_id).unwrap().messages().len(), 2);
}

#[tokio::test]
async fn retry_replaces_the_last_turn() {
    let engine = engine_with(vec![
        Script::Emit(vec![text("first answer"), StreamChunk::Done]),
        Script::Emit(vec![text("second answer"), StreamChunk::Done]),
    ])
    .await;

    let (conv_id, _) = engine
        .send_message(None, "question", &["alpha".into()])
        .await
        .unwrap();
    wait_idle(&engine, &conv_id).await;

    engine.retry(&conv_id, &["alpha".into()]).await.unwrap();
    wait_idle(&engine, &conv_id).await;

    let store = engine.store();
    let store = store.lock();
    let msgs = store.get(&conv_id).unwrap().messages();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].content, "question");
    assert_eq!(msgs[1].content, "second answer");
}

#[tokio::test]
async fn edit_truncates_and_regenerates_in_place() {
    let engine = engine_with(vec![
        Script::Emit(vec![text("answer one"), StreamChunk::Done]),
        Script::Emit(vec![text("answer two"), StreamChunk::Done]),
        Script::Emit(vec![text("revised answer one"), StreamChunk::Done]),
    ])
    .await;

    let (conv_id, _) = engine
        .send_message(None, "one", &["alpha".into()])
        .await
        .unwrap();
    wait_idle(&engine, &conv_id).await;
    engine
        .send_message(Some(&conv_id), "two", &["alpha".into()])
        .await
        .unwrap();
    wait_idle(&engine, &conv_id).await;

    let first_user = {
        let store = engine.store();
        let store = store.lock();
        store.get(&conv_id).unwrap().messages()[0].id
    };

    engine
        .edit_and_resend(&conv_id, first_user, "one, edited", &["alpha".into()])
        .await
        .unwrap();
    wait_idle(&engine, &conv_id).await;

    let store = engine.store();
    let store = store.lock();
    let msgs = store.get(&conv_id).unwrap().messages();
    assert_eq!(msgs.len(), 2);
    assert_eq!(msgs[0].content, "one, edited");
    assert_eq!(msgs[0].id, first_user);
    assert_eq!(msgs[1].content, "revised answer one");
}

#[tokio::test]
async fn deleting_mid_stream_cancels_and_repoints() {
    let engine = engine_with(vec![
        Script::Emit(vec![text("done"), StreamChunk::Done]),
        Script::EmitThenHang(vec![text("never finishes")]),
    ])
    .await;

    let (kept, _) = engine
        .send_message(None, "keep me", &["alpha".into()])
        .await
        .unwrap();
    wait_idle(&engine, &kept).await;

    let (doomed, _) = engine
        .send_message(None, "delete me", &["alpha".into()])
        .await
        .unwrap();

    let next = engine.delete_conversation(&doomed);
    assert_eq!(next.as_deref(), Some(kept.as_str()));
    wait_idle(&engine, &doomed).await;

    let store = engine.store();
    let store = store.lock();
    assert!(store.get(&doomed).is_none());
    assert_eq!(store.active_id(), Some(kept.as_str()));
    assert_eq!(store.count(), 1);
}

#[tokio::test]
async fn empty_model_list_is_rejected_before_anything_is_written() {
    let engine = engine_with(vec![]).await;

    let err = engine.send_message(None, "hello", &[]).await.unwrap_err();
    assert!(err.to_string().contains("at least one target model"));
    assert_eq!(engine.store().lock().count(), 0);
}
