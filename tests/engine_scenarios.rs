use quill::api::mock_client::{MockBackend, MockCall, MockChunk};
use quill::api::stream::SentinelPair;
use quill::state::{ChatEngine, EngineSettings, EngineUpdate, TurnOutcome};
use quill::types::{ContextId, ContextKind, ContextRecord, DocumentId, Role};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn engine(backend: &MockBackend, page_size: usize, refetch_delay: Duration) -> ChatEngine<MockBackend> {
    ChatEngine::new(
        backend.clone(),
        EngineSettings {
            model: "test-model".to_string(),
            page_size,
            refetch_delay,
            sentinels: SentinelPair::new("<START>", "<END>").expect("sentinels"),
        },
    )
}

fn conversation(backend: &MockBackend, id: &str, title: &str) -> ContextRecord {
    backend.add_context(ContextRecord::new(
        ContextId::new(id),
        ContextKind::Conversation,
        title,
    ))
}

async fn next_matching(
    rx: &mut UnboundedReceiver<EngineUpdate>,
    matches: impl Fn(&EngineUpdate) -> bool,
) -> EngineUpdate {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let update = rx.recv().await.expect("update channel open");
            if matches(&update) {
                return update;
            }
        }
    })
    .await
    .expect("timed out waiting for update")
}

fn contents(engine: &ChatEngine<MockBackend>) -> Vec<String> {
    engine
        .snapshot()
        .messages
        .into_iter()
        .map(|message| message.content)
        .collect()
}

#[tokio::test]
async fn test_hello_reply_streams_then_finalizes_with_document_id() {
    let backend = MockBackend::new();
    backend.script_reply(vec![
        MockChunk::text("Hi"),
        MockChunk::text(" there"),
        MockChunk::text("<START>{\"documentId\":\"d1\"}<END>"),
    ]);
    let engine = engine(&backend, 20, Duration::ZERO);
    let mut updates = engine.subscribe();

    let outcome = engine.send_message("hello").await.expect("send");
    assert_eq!(
        outcome,
        TurnOutcome::Completed {
            text: "Hi there".to_string(),
            document_id: Some(DocumentId::new("d1")),
        }
    );

    let mut grown = String::new();
    loop {
        match next_matching(&mut updates, |u| {
            matches!(
                u,
                EngineUpdate::ContentGrew { .. } | EngineUpdate::Finalized { .. }
            )
        })
        .await
        {
            EngineUpdate::ContentGrew { appended, .. } => grown.push_str(&appended),
            EngineUpdate::Finalized { document_id, .. } => {
                assert_eq!(document_id, Some(DocumentId::new("d1")));
                break;
            }
            _ => unreachable!(),
        }
    }
    assert_eq!(grown, "Hi there");
    assert_eq!(contents(&engine), vec!["hello", "Hi there"]);
}

#[tokio::test]
async fn test_switching_away_drops_late_chunks_for_old_context() {
    let backend = MockBackend::new();
    let a = conversation(&backend, "a", "Chat A");
    let b = conversation(&backend, "b", "Chat B");
    backend.add_document_with_id(&b.id, "b1", Role::User, "earlier in b");
    let engine = engine(&backend, 20, Duration::ZERO);
    engine.switch_to(a.clone()).await.expect("switch to a");
    let mut updates = engine.subscribe();

    let feed = backend.script_feed_reply();
    let sending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.send_message("question for a").await })
    };
    feed.send_text("partial answer");
    next_matching(&mut updates, |u| matches!(u, EngineUpdate::ContentGrew { .. })).await;

    engine.switch_to(b.clone()).await.expect("switch to b");
    feed.send_text(" that should never show");
    drop(feed);

    let outcome = sending.await.expect("join").expect("send");
    assert_eq!(outcome, TurnOutcome::Detached);

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.context.map(|r| r.id), Some(b.id.clone()));
    assert!(!snapshot.streaming);
    assert_eq!(contents(&engine), vec!["earlier in b"]);
    assert!(snapshot.messages.iter().all(|message| message.owner == b.id));
}

#[tokio::test]
async fn test_pagination_terminates_without_duplicates() {
    let backend = MockBackend::new();
    let record = conversation(&backend, "c1", "Long chat");
    for n in 1..=7 {
        let role = if n % 2 == 1 { Role::User } else { Role::Assistant };
        backend.add_document_with_id(&record.id, &format!("d{n}"), role, &format!("m{n}"));
    }
    let engine = engine(&backend, 3, Duration::ZERO);
    engine.switch_to(record).await.expect("switch");
    assert_eq!(contents(&engine), vec!["m5", "m6", "m7"]);
    assert!(engine.snapshot().has_more);

    let mut pages = 0;
    loop {
        let added = engine.load_older().await.expect("load older");
        if added == 0 {
            break;
        }
        pages += 1;
        assert!(pages <= 3, "pagination did not terminate");
    }

    assert_eq!(pages, 2);
    assert!(!engine.snapshot().has_more);
    assert_eq!(
        contents(&engine),
        vec!["m1", "m2", "m3", "m4", "m5", "m6", "m7"]
    );
    let ids: HashSet<DocumentId> = engine
        .snapshot()
        .messages
        .into_iter()
        .filter_map(|message| message.server_document_id)
        .collect();
    assert_eq!(ids.len(), 7);
}

#[tokio::test]
async fn test_page_keeps_id_order_when_fetches_finish_out_of_order() {
    let backend = MockBackend::new();
    let record = conversation(&backend, "c1", "Ordered");
    for id in ["3", "1", "2"] {
        backend.add_document_with_id(&record.id, id, Role::User, &format!("body {id}"));
    }
    backend.set_fetch_delay("1", Duration::from_millis(10));
    backend.set_fetch_delay("3", Duration::from_millis(40));
    backend.set_fetch_delay("2", Duration::from_millis(80));
    let engine = engine(&backend, 10, Duration::ZERO);

    engine.switch_to(record).await.expect("switch");
    assert_eq!(contents(&engine), vec!["body 3", "body 1", "body 2"]);
}

#[tokio::test]
async fn test_late_reply_appears_after_refetch_delay() {
    let backend = MockBackend::new();
    let record = conversation(&backend, "c1", "Waiting");
    backend.add_document_with_id(&record.id, "d1", Role::User, "slow question");
    let engine = engine(&backend, 20, Duration::from_millis(30));
    let mut updates = engine.subscribe();

    engine.switch_to(record.clone()).await.expect("switch");
    assert_eq!(contents(&engine), vec!["slow question"]);

    backend.add_document_with_id(&record.id, "d2", Role::Assistant, "finished later");
    next_matching(&mut updates, |u| {
        matches!(u, EngineUpdate::HistoryReplaced { .. })
    })
    .await;
    assert_eq!(contents(&engine), vec!["slow question", "finished later"]);
}

#[tokio::test]
async fn test_leaving_default_titled_context_with_user_turn_generates_title() {
    let backend = MockBackend::new();
    backend.set_title("  Greetings  ");
    backend.script_reply(vec![MockChunk::text(
        "Hi<START>{\"documentId\":\"r1\"}<END>",
    )]);
    let engine = engine(&backend, 2, Duration::ZERO);

    engine.send_message("hello").await.expect("send");
    let created = engine.active_context().expect("created");
    assert!(created.has_default_title());

    engine.new_context(ContextKind::Conversation).await;

    assert_eq!(backend.summarize_calls(), vec![vec!["hello".to_string()]]);
    assert_eq!(
        backend.context(&created.id).map(|r| r.title),
        Some("Greetings".to_string())
    );
}

#[tokio::test]
async fn test_auto_title_reads_history_beyond_first_page() {
    let backend = MockBackend::new();
    backend.set_title("Long story");
    let record = conversation(&backend, "c1", ContextKind::Conversation.default_title());
    let other = conversation(&backend, "c2", "Other");
    for n in 1..=5 {
        backend.add_document_with_id(&record.id, &format!("u{n}"), Role::User, &format!("q{n}"));
        backend.add_document_with_id(&record.id, &format!("a{n}"), Role::Assistant, "ok");
    }
    let engine = engine(&backend, 2, Duration::ZERO);
    let mut updates = engine.subscribe();

    engine.switch_to(record.clone()).await.expect("switch");
    engine.switch_to(other).await.expect("switch away");

    let update = next_matching(&mut updates, |u| {
        matches!(u, EngineUpdate::TitleChanged { .. })
    })
    .await;
    assert_eq!(
        update,
        EngineUpdate::TitleChanged {
            context: record.id.clone(),
            title: "Long story".to_string(),
        }
    );
    let expected: Vec<String> = (1..=5).map(|n| format!("q{n}")).collect();
    assert_eq!(backend.summarize_calls(), vec![expected]);
}

#[tokio::test]
async fn test_auto_title_skips_named_and_empty_contexts() {
    let backend = MockBackend::new();
    backend.set_title("Unused");
    let named = conversation(&backend, "named", "Trip plans");
    backend.add_document_with_id(&named.id, "n1", Role::User, "where to?");
    let empty = conversation(&backend, "empty", ContextKind::Conversation.default_title());
    let engine = engine(&backend, 20, Duration::ZERO);

    engine.switch_to(named).await.expect("switch");
    engine.switch_to(empty).await.expect("switch");
    engine.new_context(ContextKind::Conversation).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(backend.summarize_calls().is_empty());
    assert!(!backend
        .calls()
        .iter()
        .any(|call| matches!(call, MockCall::Rename { .. })));
}

#[tokio::test]
async fn test_failed_body_fetch_leaves_siblings_in_place() {
    let backend = MockBackend::new();
    let record = conversation(&backend, "c1", "Patchy");
    for id in ["d1", "d2", "d3"] {
        backend.add_document_with_id(&record.id, id, Role::Assistant, id);
    }
    backend.fail_fetch("d2");
    let engine = engine(&backend, 10, Duration::ZERO);

    engine.switch_to(record).await.expect("switch");
    assert_eq!(contents(&engine), vec!["d1", "d3"]);
}

#[tokio::test]
async fn test_work_and_conversation_slots_are_independent() {
    let backend = MockBackend::new();
    let chat = conversation(&backend, "c1", "Chat");
    let work = backend.add_context(ContextRecord::new(
        ContextId::new("w1"),
        ContextKind::Work,
        "Novel",
    ));
    backend.add_document_with_id(&work.id, "w-doc", Role::Assistant, "chapter one");
    let engine = engine(&backend, 20, Duration::ZERO);

    engine.switch_to(chat.clone()).await.expect("switch chat");
    engine.switch_to(work.clone()).await.expect("switch work");
    assert_eq!(engine.snapshot().kind, ContextKind::Work);
    assert_eq!(contents(&engine), vec!["chapter one"]);

    backend.script_reply(vec![MockChunk::text("more prose")]);
    engine.send_message("continue").await.expect("send");
    assert!(backend.calls().iter().any(|call| matches!(
        call,
        MockCall::SendTurn(request)
            if request.kind == ContextKind::Work && request.context_id.as_ref() == Some(&work.id)
    )));
}

#[tokio::test]
async fn test_turn_sent_while_history_loads_shows_once() {
    let backend = MockBackend::new();
    let record = conversation(&backend, "slow", "Slow list");
    backend.add_document_with_id(&record.id, "e1", Role::User, "earlier");
    backend.set_list_delay(&record.id, Duration::from_millis(50));
    backend.script_reply(vec![MockChunk::text("Hi")]);
    let engine = engine(&backend, 20, Duration::ZERO);

    let switching = {
        let engine = engine.clone();
        let record = record.clone();
        tokio::spawn(async move { engine.switch_to(record).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let outcome = engine.send_message("hello").await.expect("send");
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    switching.await.expect("join").expect("switch");

    assert_eq!(contents(&engine), vec!["earlier", "hello", "Hi"]);
}

#[tokio::test]
async fn test_slow_load_does_not_overwrite_later_switch() {
    let backend = MockBackend::new();
    let a = conversation(&backend, "a", "Chat A");
    let b = conversation(&backend, "b", "Chat B");
    backend.add_document_with_id(&a.id, "a1", Role::User, "from a");
    backend.add_document_with_id(&b.id, "b1", Role::User, "from b");
    backend.set_fetch_delay("a1", Duration::from_millis(100));
    let engine = engine(&backend, 20, Duration::ZERO);

    let slow = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.switch_to(a).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.switch_to(b.clone()).await.expect("switch to b");
    slow.await.expect("join").expect("switch to a");

    assert_eq!(engine.active_context().map(|r| r.id), Some(b.id));
    assert_eq!(contents(&engine), vec!["from b"]);
}

#[tokio::test]
async fn test_failed_title_generation_does_not_block_leaving() {
    let backend = MockBackend::new();
    backend.script_reply(vec![MockChunk::text("Hi")]);
    let engine = engine(&backend, 20, Duration::ZERO);
    engine.send_message("hello").await.expect("send");
    let created = engine.active_context().expect("created");

    engine.new_context(ContextKind::Conversation).await;

    assert_eq!(backend.summarize_calls().len(), 1);
    assert!(!backend
        .calls()
        .iter()
        .any(|call| matches!(call, MockCall::Rename { .. })));
    assert!(engine.snapshot().context.is_none());
    assert!(backend
        .context(&created.id)
        .is_some_and(|record| record.has_default_title()));
}

#[tokio::test]
async fn test_manual_rename_during_title_generation_wins() {
    let backend = MockBackend::new();
    backend.set_title("Generated");
    backend.set_summarize_delay(Duration::from_millis(80));
    let record = conversation(&backend, "c1", ContextKind::Conversation.default_title());
    let other = conversation(&backend, "c2", "Other");
    backend.add_document_with_id(&record.id, "u1", Role::User, "plan a trip");
    let engine = engine(&backend, 20, Duration::ZERO);

    engine.switch_to(record.clone()).await.expect("switch");
    engine.switch_to(other).await.expect("switch away");
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine
        .rename_context(record.kind, &record.id, "My trip")
        .await
        .expect("rename");
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(backend.summarize_calls().len(), 1);
    assert_eq!(
        backend.context(&record.id).map(|r| r.title),
        Some("My trip".to_string())
    );
    let renames: Vec<String> = backend
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            MockCall::Rename { title, .. } => Some(title),
            _ => None,
        })
        .collect();
    assert_eq!(renames, vec!["My trip".to_string()]);
}
