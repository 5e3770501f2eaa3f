//! End-to-end pipeline scenarios over scripted store/LLM/embedding fakes.

mod support;

use std::sync::{Arc, Mutex};

use serde_json::json;

use memforge_core::memory::{AddMemoriesRequest, BulkItem, BulkOptions, BulkOutcome, SearchMemoryRequest};

use support::{row, Harness, ScriptedDriver, ScriptedLlm};

/// Extraction reads resolve to an already-done memory so background work
/// settles immediately.
fn with_done_extraction(driver: &Arc<ScriptedDriver>) {
    driver.route_rows(
        "m.extractionStatus AS status",
        vec![row(&[
            ("status", json!("done")),
            ("content", json!("")),
            ("userId", json!("u")),
        ])],
    );
}

/// Scenario: insert, then an identical statement skips as a duplicate and
/// returns the existing id.
#[tokio::test]
async fn test_insert_then_duplicate() {
    let stored: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));

    let driver = ScriptedDriver::new();
    with_done_extraction(&driver);
    driver.route_fn("CREATE (m:Memory", {
        let stored = stored.clone();
        move |stmt| {
            let id = stmt.params["id"].as_str().unwrap_or_default().to_string();
            let content = stmt.params["content"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            stored.lock().unwrap().push((id.clone(), content));
            vec![row(&[("id", json!(id))])]
        }
    });
    driver.route_fn("vector_search.search('memory_vectors'", {
        let stored = stored.clone();
        move |_| {
            stored
                .lock()
                .unwrap()
                .iter()
                .map(|(id, content)| {
                    row(&[
                        ("id", json!(id)),
                        ("content", json!(content)),
                        ("similarity", json!(0.95)),
                    ])
                })
                .collect()
        }
    });

    let llm = ScriptedLlm::new().on(|prompt| {
        prompt
            .starts_with("NEW: ")
            .then(|| "DUPLICATE".to_string())
    });

    let harness = Harness::new(driver, llm);
    let context = Harness::context("u");

    let first = harness
        .orchestrator
        .add_memories(
            &context,
            AddMemoriesRequest {
                content: vec!["My blood type is O positive.".to_string()],
                ..AddMemoriesRequest::default()
            },
        )
        .await;
    assert_eq!(first.stored, 1);
    assert_eq!(first.ids.len(), 1);
    let first_id = first.ids[0].clone();

    let second = harness
        .orchestrator
        .add_memories(
            &context,
            AddMemoriesRequest {
                content: vec!["My blood type is O positive.".to_string()],
                ..AddMemoriesRequest::default()
            },
        )
        .await;
    assert_eq!(second.stored, 0);
    assert_eq!(second.skipped, 1);
    assert_eq!(second.ids, vec![first_id]);

    // Exactly one memory was ever created.
    assert_eq!(stored.lock().unwrap().len(), 1);
    harness.drain().await;
}

/// Intra-batch idempotence: the same text three times in one batch yields
/// one add and two skips, with a single create statement.
#[tokio::test]
async fn test_intra_batch_dedup_idempotence() {
    let driver = ScriptedDriver::new();
    with_done_extraction(&driver);
    driver.route_fn("CREATE (m:Memory", |stmt| {
        vec![row(&[("id", stmt.params["id"].clone())])]
    });

    let harness = Harness::new(driver.clone(), ScriptedLlm::new());
    let context = Harness::context("u");

    let text = "I take my coffee black.".to_string();
    let response = harness
        .orchestrator
        .add_memories(
            &context,
            AddMemoriesRequest {
                content: vec![text.clone(), text.clone(), text],
                ..AddMemoriesRequest::default()
            },
        )
        .await;

    assert_eq!(response.stored, 1);
    assert_eq!(response.skipped, 2);
    assert!(response.errors.is_empty());
    assert_eq!(driver.queries_containing("CREATE (m:Memory").len(), 1);
    harness.drain().await;
}

/// Supersession: the old memory is invalidated and linked in one atomic
/// statement, tags inherit, and a SUPERSEDE history record follows.
#[tokio::test]
async fn test_supersede_writes_atomic_statement() {
    let driver = ScriptedDriver::new();
    with_done_extraction(&driver);
    driver.route_rows(
        "SET old.invalidAt",
        vec![row(&[
            ("id", json!("ZNEW000000000")),
            ("oldContent", json!("I live in NYC")),
        ])],
    );

    let harness = Harness::new(driver.clone(), ScriptedLlm::new());
    let receipt = harness
        .writer
        .supersede("u", "AOLD000000000", "I moved to London", Some("e2e"), None)
        .await
        .expect("supersede succeeds");
    assert!(!receipt.id.is_empty());

    let statements = driver.queries_containing("SUPERSEDES");
    assert_eq!(statements.len(), 1);
    let statement = &statements[0];
    // One atomic statement: invalidate old, create new, link, inherit tags.
    assert!(statement.query.contains("SET old.invalidAt = $now"));
    assert!(statement.query.contains("CREATE (new:Memory"));
    assert!(statement.query.contains("(new)-[:SUPERSEDES {at: $now}]->(old)"));
    assert!(statement.query.contains("CASE WHEN $tags IS NULL THEN old.tags"));
    assert_eq!(statement.params["oldId"], json!("AOLD000000000"));
    assert_eq!(statement.params["userId"], json!("u"));
    assert_eq!(statement.params["tags"], json!(null));

    harness.drain().await;
    let history = driver.queries_containing("MemoryHistory");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].params["action"], json!("SUPERSEDE"));
    assert_eq!(history[0].params["previousValue"], json!("I live in NYC"));
}

/// Intent routing: "forget about ..." soft-deletes the matching memory.
#[tokio::test]
async fn test_invalidate_intent_soft_deletes_match() {
    let phone_row = || {
        vec![row(&[
            ("id", json!("APHONE0000000")),
            ("content", json!("My phone is 555-1234")),
            ("createdAt", json!("2026-01-01T00:00:00Z")),
            ("updatedAt", json!("2026-01-01T00:00:00Z")),
            ("tags", json!([])),
            ("categories", json!([])),
            ("score", json!(4.2)),
            ("similarity", json!(0.9)),
        ])]
    };

    let driver = ScriptedDriver::new();
    with_done_extraction(&driver);
    driver.route_fn("text_search.search", move |_| phone_row());
    driver.route_fn("vector_search.search('memory_vectors'", move |_| {
        vec![row(&[
            ("id", json!("APHONE0000000")),
            ("content", json!("My phone is 555-1234")),
            ("createdAt", json!("2026-01-01T00:00:00Z")),
            ("updatedAt", json!("2026-01-01T00:00:00Z")),
            ("tags", json!([])),
            ("categories", json!([])),
            ("similarity", json!(0.9)),
        ])]
    });
    driver.route_fn("SET m.state = 'deleted'", |stmt| {
        vec![row(&[
            ("id", stmt.params["memoryId"].clone()),
            ("content", json!("My phone is 555-1234")),
        ])]
    });

    let llm = ScriptedLlm::new().on(|prompt| {
        prompt.contains("forget about").then(|| {
            json!({"intent": "INVALIDATE", "target": "old phone number"}).to_string()
        })
    });

    let harness = Harness::new(driver.clone(), llm);
    let response = harness
        .orchestrator
        .add_memories(
            &Harness::context("u"),
            AddMemoriesRequest {
                content: vec!["forget about my old phone number".to_string()],
                ..AddMemoriesRequest::default()
            },
        )
        .await;

    assert!(response.errors.is_empty());
    assert_eq!(response.invalidated, 1);
    assert_eq!(response.stored, 0);
    let deletes = driver.queries_containing("SET m.state = 'deleted'");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].params["memoryId"], json!("APHONE0000000"));
    harness.drain().await;
}

/// DELETE_ENTITY: the entity node goes away, memories stay.
#[tokio::test]
async fn test_delete_entity_intent() {
    let driver = ScriptedDriver::new();
    with_done_extraction(&driver);
    driver.route_rows(
        "toLower(e.name) = toLower($target)",
        vec![row(&[
            ("id", json!("BENT00000000B")),
            ("name", json!("Bob")),
            ("mentionCount", json!(3)),
            ("relationshipCount", json!(1)),
        ])],
    );

    let llm = ScriptedLlm::new().on(|prompt| {
        prompt
            .contains("stop tracking")
            .then(|| json!({"intent": "DELETE_ENTITY", "entityName": "Bob"}).to_string())
    });

    let harness = Harness::new(driver.clone(), llm);
    let response = harness
        .orchestrator
        .add_memories(
            &Harness::context("u"),
            AddMemoriesRequest {
                content: vec!["stop tracking Bob".to_string()],
                ..AddMemoriesRequest::default()
            },
        )
        .await;

    assert_eq!(response.deleted, vec!["Bob".to_string()]);
    assert!(response.errors.is_empty());

    let deletes = driver.queries_containing("DETACH DELETE e");
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].params["entityId"], json!("BENT00000000B"));
    // No memory writes happened.
    assert!(driver.queries_containing("CREATE (m:Memory").is_empty());
    harness.drain().await;
}

/// Bulk ingestion: case-insensitive in-batch dedup, one embedding batch of
/// the survivors, one UNWIND write.
#[tokio::test]
async fn test_bulk_ingestion_round_trips() {
    let driver = ScriptedDriver::new();
    with_done_extraction(&driver);

    let harness = Harness::new(driver.clone(), ScriptedLlm::new());
    let outcomes = harness
        .bulk
        .bulk_add(
            "u",
            "importer",
            vec![
                BulkItem {
                    text: "A".to_string(),
                    metadata: None,
                    valid_at: None,
                },
                BulkItem {
                    text: "a".to_string(),
                    metadata: None,
                    valid_at: None,
                },
                BulkItem {
                    text: "B".to_string(),
                    metadata: None,
                    valid_at: None,
                },
            ],
            BulkOptions::default(),
        )
        .await
        .expect("bulk add succeeds");

    assert!(matches!(outcomes[0], BulkOutcome::Added { .. }));
    assert_eq!(outcomes[1], BulkOutcome::SkippedDuplicate { id: None });
    assert!(matches!(outcomes[2], BulkOutcome::Added { .. }));

    // Exactly one batched embedding call, of size 2 (dedup's per-candidate
    // probes are single-text calls).
    let sizes = harness.embedder.batch_sizes.lock().unwrap().clone();
    assert_eq!(sizes.iter().filter(|&&s| s == 2).count(), 1);

    // One UNWIND write created both memories.
    let unwinds = driver.queries_containing("UNWIND $memories AS mem");
    assert_eq!(unwinds.len(), 1);
    assert_eq!(
        unwinds[0].params["memories"].as_array().map(Vec::len),
        Some(2)
    );
    harness.drain().await;
}

/// Namespace isolation: a foreign user id never matches, and every
/// id-addressed memory statement goes through the ownership edge.
#[tokio::test]
async fn test_namespace_isolation() {
    let driver = ScriptedDriver::new();
    with_done_extraction(&driver);
    driver.route_fn("SET m.state = 'deleted'", |stmt| {
        if stmt.params["userId"] == json!("owner") {
            vec![row(&[
                ("id", stmt.params["memoryId"].clone()),
                ("content", json!("secret")),
            ])]
        } else {
            Vec::new()
        }
    });

    let harness = Harness::new(driver.clone(), ScriptedLlm::new());

    let as_owner = harness
        .writer
        .delete("owner", "CMEM000000000")
        .await
        .expect("delete runs");
    assert!(as_owner);

    let as_intruder = harness
        .writer
        .delete("intruder", "CMEM000000000")
        .await
        .expect("delete runs");
    assert!(!as_intruder, "foreign user must see not-found semantics");

    harness.drain().await;
    for statement in driver.journal() {
        if statement.query.contains("Memory {id: $") {
            assert!(
                statement.query.contains("HAS_MEMORY"),
                "id-addressed memory statement must traverse the ownership edge: {}",
                statement.query
            );
        }
    }
}

/// Archive closes a memory's validity; pause leaves it valid. Both refuse
/// non-active memories.
#[tokio::test]
async fn test_archive_and_pause_lifecycle() {
    let driver = ScriptedDriver::new();
    with_done_extraction(&driver);
    driver.route_fn("SET m.state = 'archived'", |stmt| {
        vec![row(&[
            ("id", stmt.params["memoryId"].clone()),
            ("content", json!("tracked issue")),
        ])]
    });
    driver.route_fn("SET m.state = 'paused'", |stmt| {
        vec![row(&[
            ("id", stmt.params["memoryId"].clone()),
            ("content", json!("quiet fact")),
        ])]
    });

    let harness = Harness::new(driver.clone(), ScriptedLlm::new());
    assert!(harness.writer.archive("u", "F1ARCHIVE0000").await.unwrap());
    assert!(harness.writer.pause("u", "F2PAUSE000000").await.unwrap());

    let archive = &driver.queries_containing("SET m.state = 'archived'")[0];
    assert!(archive.query.contains("WHERE m.state = 'active'"));
    assert!(archive.query.contains("m.invalidAt = $now"));

    let pause = &driver.queries_containing("SET m.state = 'paused'")[0];
    assert!(pause.query.contains("WHERE m.state = 'active'"));
    assert!(!pause.query.contains("invalidAt"), "paused memories stay valid");

    harness.drain().await;
    let actions: Vec<_> = driver
        .queries_containing("MemoryHistory")
        .iter()
        .map(|s| s.params["action"].clone())
        .collect();
    assert!(actions.contains(&json!("ARCHIVE")));
    assert!(actions.contains(&json!("PAUSE")));
}

/// Browse mode: one transactional round trip returning count, page,
/// categories, and tags.
#[tokio::test]
async fn test_search_memory_browse_mode() {
    let driver = ScriptedDriver::new();
    driver.route_rows(
        "RETURN size(items) AS total",
        vec![row(&[
            ("total", json!(12)),
            (
                "page",
                json!([
                    {"id": "D1", "content": "newest", "created_at": "2026-02-01T00:00:00Z",
                     "tags": ["t"], "categories": ["work"]},
                    {"id": "D2", "content": "older", "created_at": "2026-01-01T00:00:00Z",
                     "tags": [], "categories": []},
                ]),
            ),
        ])],
    );
    driver.route_rows(
        "RETURN DISTINCT c.name AS name",
        vec![row(&[("name", json!("work"))])],
    );
    driver.route_rows(
        "RETURN DISTINCT tag",
        vec![row(&[("tag", json!("t"))])],
    );

    let harness = Harness::new(driver.clone(), ScriptedLlm::new());
    let response = harness
        .orchestrator
        .search_memory(
            &Harness::context("u"),
            SearchMemoryRequest::default(),
        )
        .await
        .expect("browse succeeds");

    assert_eq!(response.total, Some(12));
    assert_eq!(response.items.as_ref().map(Vec::len), Some(2));
    assert_eq!(response.categories, Some(vec!["work".to_string()]));
    assert_eq!(response.tags, Some(vec!["t".to_string()]));
    assert!(response.results.is_none());
}

/// Search mode: fused hits come back ranked with display scores and the
/// confidence verdict; ACCESSED logging happens off-path.
#[tokio::test]
async fn test_search_memory_query_mode() {
    let driver = ScriptedDriver::new();
    driver.route_rows(
        "text_search.search",
        vec![row(&[
            ("id", json!("E1TEXT0000000")),
            ("content", json!("Project Atlas kickoff notes")),
            ("createdAt", json!("2026-03-01T00:00:00Z")),
            ("updatedAt", json!("2026-03-01T00:00:00Z")),
            ("tags", json!([])),
            ("categories", json!(["work"])),
            ("score", json!(7.5)),
        ])],
    );
    driver.route_rows("vector_search.search('memory_vectors'", Vec::new());

    let harness = Harness::new(driver.clone(), ScriptedLlm::new());
    let response = harness
        .orchestrator
        .search_memory(
            &Harness::context("u"),
            SearchMemoryRequest {
                query: Some("atlas kickoff".to_string()),
                ..SearchMemoryRequest::default()
            },
        )
        .await
        .expect("search succeeds");

    let results = response.results.expect("search results");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["id"], json!("E1TEXT0000000"));
    assert_eq!(results[0]["text_rank"], json!(1));
    assert_eq!(response.confident, Some(true));

    harness.drain().await;
    let accesses = driver.queries_containing("ACCESSED");
    assert_eq!(accesses.len(), 1);
    assert_eq!(accesses[0].params["appName"], json!("e2e"));
    assert_eq!(accesses[0].params["query"], json!("atlas kickoff"));
}
