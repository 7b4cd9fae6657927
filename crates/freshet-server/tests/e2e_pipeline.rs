//! End-to-end tests for the streaming pipeline.
//!
//! Exercises the path a serving process drives:
//! claim thread → stream parts through the throttled streamer → reader
//! follows by cursor → finalize → release thread — plus the failure
//! paths the maintenance daemon exists for: a crashed producer leaving a
//! stuck thread, and cancellation racing an in-flight generation.

use std::sync::Arc;
use std::time::Duration;

use freshet_cas::BlobStore;
use freshet_kernel::{
    sweep, ChatDb, ChatStore, DeltaStreamer, FileStore, GenerationRegistry,
};
use freshet_types::{concat_text, Message, StreamOrigin, StreamState, UserId};

fn memory_store() -> Arc<ChatStore> {
    Arc::new(ChatStore::with_db(ChatDb::in_memory().unwrap()))
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Walk a stream to its terminal state the way a reader does: catch up
/// from the current cursor, advance past every delta, stop on a terminal
/// state. Returns the reconstructed text.
fn read_to_end(store: &ChatStore, stream_id: freshet_types::StreamId) -> (StreamState, String) {
    let mut cursor = 0;
    let mut text = String::new();
    loop {
        let (state, deltas) = store.catch_up(stream_id, cursor).unwrap();
        for delta in &deltas {
            text.push_str(&concat_text(delta.parts.iter()));
            cursor = delta.end;
        }
        if state.is_terminal() {
            return (state, text);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_generation_roundtrip() {
    let store = memory_store();
    let thread_id = store.create_thread("roundtrip").unwrap();
    let user_id = UserId::new();

    store.begin_generation(thread_id).unwrap();
    let prompt = Message::user(thread_id, "what is the answer?", 0);
    store.save_message(&prompt, &[]).unwrap();

    let origin = StreamOrigin::new(thread_id, user_id, 1).with_model("anthropic", "claude-sonnet-4");
    let streamer = DeltaStreamer::new(Arc::clone(&store), origin);

    // Two throttle windows' worth of output.
    streamer.add_text("Working through it. ").unwrap();
    tokio::time::advance(Duration::from_millis(300)).await;
    settle().await;
    streamer.add_text("The answer is: forty-two.").unwrap();

    let stream_id = streamer.stream_id().unwrap();
    let reply = Message::assistant(
        thread_id,
        vec![freshet_types::OutputPart::text("Working through it. The answer is: forty-two.")],
        1,
        0,
    );
    let end = streamer.finish(std::slice::from_ref(&reply)).await.unwrap();
    store.save_message(&reply, &[]).unwrap();
    store.end_generation(thread_id).unwrap();

    // The reader reconstructs exactly what was streamed, and the final
    // cursor covers every part.
    let (state, text) = read_to_end(&store, stream_id);
    assert!(matches!(state, StreamState::Finished { .. }));
    assert_eq!(text, "Working through it. The answer is: forty-two.");

    let (_, none_past_end) = store.catch_up(stream_id, end).unwrap();
    assert!(none_past_end.is_empty());

    // Nothing for the sweep to do after a clean finish.
    let stats = sweep::run_sweep(&store, Duration::ZERO, Duration::from_secs(600)).unwrap();
    assert_eq!(stats.repaired, 0);
    assert_eq!(stats.reaped_streams, 0);
}

#[tokio::test(start_paused = true)]
async fn test_crashed_producer_repair_path() {
    let store = memory_store();
    let thread_id = store.create_thread("crash").unwrap();
    store.begin_generation(thread_id).unwrap();

    let origin = StreamOrigin::new(thread_id, UserId::new(), 0);
    let streamer = DeltaStreamer::new(Arc::clone(&store), origin);
    streamer.add_text("partial output that will never finish. ").unwrap();
    let stream_id = streamer.stream_id().unwrap();

    // Simulate the crash: the streamer is dropped without finish; its
    // stream row stays streaming and the thread stays claimed.
    drop(streamer);
    assert_eq!(store.generation_state(thread_id).unwrap(), (true, false));

    // Let the heartbeat age past a zero timeout, then run the sweep the
    // daemon runs: the stream is reaped, then the thread repaired.
    std::thread::sleep(Duration::from_millis(5));
    let stats = sweep::run_sweep(&store, Duration::ZERO, Duration::ZERO).unwrap();
    assert_eq!(stats.reaped_streams, 1);
    assert_eq!(stats.repaired, 1);
    assert_eq!(store.generation_state(thread_id).unwrap(), (false, false));

    // Readers observe the failure, with the partial output intact.
    let (state, text) = read_to_end(&store, stream_id);
    assert!(matches!(state, StreamState::Error { .. }));
    assert_eq!(text, "partial output that will never finish. ");
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_the_stream() {
    let store = memory_store();
    let registry = GenerationRegistry::new();
    let thread_id = store.create_thread("cancel").unwrap();

    store.begin_generation(thread_id).unwrap();
    let token = registry.register(thread_id);

    let origin = StreamOrigin::new(thread_id, UserId::new(), 0);
    let streamer = DeltaStreamer::new(Arc::clone(&store), origin).with_cancel(token);
    streamer.add_text("before cancel. ").unwrap();
    let stream_id = streamer.stream_id().unwrap();

    // The cancel endpoint sets the durable flag and fires the token.
    assert!(store.request_cancel(thread_id).unwrap());
    assert!(registry.cancel(thread_id));

    // Everything after the cancel is silently dropped; the driver marks
    // the stream and releases the thread.
    streamer.add_text("after cancel, never persisted").unwrap();
    store.fail_stream(stream_id, "cancelled by user").unwrap();
    store.end_generation(thread_id).unwrap();
    registry.remove(thread_id);

    let (state, text) = read_to_end(&store, stream_id);
    assert!(matches!(state, StreamState::Error { .. }));
    assert_eq!(text, "before cancel. ");
}

#[test]
fn test_attachment_lifecycle_across_the_stores() {
    let dir = tempfile::tempdir().unwrap();
    let store = memory_store();
    let blobs = BlobStore::open(dir.path().join("blobs")).unwrap();
    let files = Arc::new(FileStore::new(store.db(), blobs));

    let thread_id = store.create_thread("attachments").unwrap();
    let added = files
        .add_file(b"quarterly numbers", Some("q3.csv"), "text/csv")
        .unwrap();

    let msg = Message::user(thread_id, "see the attached numbers", 0);
    store.save_message(&msg, &[added.file_id]).unwrap();
    assert_eq!(files.get_file(added.file_id).unwrap().refcount, 1);
    assert_eq!(files.read(added.file_id).unwrap(), b"quarterly numbers");

    // Deleting the thread releases the reference; the retention window
    // still protects the file until it ages out.
    store.delete_thread(thread_id).unwrap();
    assert_eq!(files.get_file(added.file_id).unwrap().refcount, 0);
    files
        .cleanup_orphaned_files(freshet_kernel::FILE_RETENTION)
        .unwrap();
    assert!(files.get_file(added.file_id).is_ok());

    std::thread::sleep(Duration::from_millis(5));
    let deleted = files.cleanup_orphaned_files(Duration::ZERO).unwrap();
    assert_eq!(deleted, 1);
}
