//! End-to-end runs of query text through the engine over the memory store.

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use quarry::prelude::*;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

const FIXTURE: &str = r#"{
    "User": [
        { "id": 1, "name": "Ada", "active": true, "role": "admin", "age": 36 },
        { "id": 2, "name": "Bob", "active": false, "role": "member", "age": 24 },
        { "id": 3, "name": "Cy", "active": true, "role": "member", "age": 41 }
    ],
    "Post": [
        { "id": 1, "title": "Hello", "authorId": 1, "tags": ["intro", "meta"] }
    ]
}"#;

/// Passes calls through to a memory store and remembers them.
struct Recording {
    inner: MemoryStore,
    calls: Mutex<Vec<(String, Operation, Value)>>,
}

impl Recording {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::from_fixture_str(None, FIXTURE).unwrap(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, Operation, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataSource for Recording {
    async fn describe(&self) -> Result<SchemaDescription, DataAccessError> {
        self.inner.describe().await
    }

    async fn invoke(
        &self,
        entity: &str,
        operation: Operation,
        arguments: Arguments,
    ) -> Result<Value, DataAccessError> {
        self.calls.lock().unwrap().push((
            entity.to_string(),
            operation,
            Value::Object(arguments.clone()),
        ));
        self.inner.invoke(entity, operation, arguments).await
    }
}

async fn engine() -> (Arc<Recording>, Engine) {
    let source = Recording::new();
    let engine = Engine::connect(source.clone(), ResolverOptions::default())
        .await
        .unwrap();
    (source, engine)
}

#[tokio::test]
async fn test_active_users_become_two_rows() {
    let (_, engine) = engine().await;
    let set = engine
        .run("user.findMany({ where: { active: true } })")
        .await
        .unwrap();

    assert_eq!(set.len(), 2);
    assert_eq!(set.columns, vec!["id", "name", "active", "role", "age"]);
    let names: Vec<_> = set.rows.iter().map(|r| r.get("name").cloned()).collect();
    assert_eq!(
        names,
        vec![
            Some(Cell::Text("Ada".into())),
            Some(Cell::Text("Cy".into()))
        ]
    );
}

#[tokio::test]
async fn test_unknown_entity_never_dispatched() {
    let (source, engine) = engine().await;
    let err = engine.run("ghost.findMany({})").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UnknownEntity);
    assert!(source.calls().is_empty());
}

#[tokio::test]
async fn test_unbalanced_braces_report_offset() {
    let (source, engine) = engine().await;
    let text = "user.findMany({ where: { active: true )";
    let err = engine.run(text).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::MalformedArguments);
    assert_eq!(err.position(), Some(text.len() - 1));
    assert!(source.calls().is_empty());
}

#[tokio::test]
async fn test_empty_query() {
    let (source, engine) = engine().await;
    let outcome = engine.execute_query("").await;

    assert_eq!(
        serde_json::to_value(&outcome).unwrap(),
        json!({ "error": "Query is required", "code": "EMPTY_QUERY" })
    );
    assert_eq!(outcome.status_code(), 400);
    assert!(source.calls().is_empty());
}

#[tokio::test]
async fn test_empty_arguments_dispatched_once_per_operation() {
    for op in ["findFirst", "findMany", "count"] {
        let (source, engine) = engine().await;
        engine.run(&format!("user.{}({{}})", op)).await.unwrap();

        let calls = source.calls();
        assert_eq!(calls.len(), 1, "{}", op);
        assert_eq!(calls[0].0, "User");
        assert_eq!(calls[0].1.name(), op);
        assert_eq!(calls[0].2, json!({}));
    }

    // Operations whose store needs arguments still get exactly one attempt.
    let (source, engine) = engine().await;
    let err = engine.run("user.update({})").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DataAccess);
    assert_eq!(source.calls().len(), 1);
}

#[tokio::test]
async fn test_mutation_then_read() {
    let (_, engine) = engine().await;
    let created = engine
        .run("user.create({ data: { name: 'Dee', active: true, role: 'member', age: 29 } })")
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created.rows[0].get("id"), Some(&Cell::Number(4.into())));

    let count = engine
        .run("user.count({ where: { active: true } })")
        .await
        .unwrap();
    assert_eq!(count.columns, vec!["value"]);
    assert_eq!(count.rows[0].get("value"), Some(&Cell::Number(3.into())));
}

#[tokio::test]
async fn test_store_error_passes_through_verbatim() {
    let (_, engine) = engine().await;
    let outcome = engine
        .execute_query("user.delete({ where: { id: 99 } })")
        .await;

    assert_eq!(
        serde_json::to_value(&outcome).unwrap(),
        json!({ "error": "Record to delete does not exist.", "code": "DATA_ACCESS_ERROR" })
    );
    assert_eq!(outcome.status_code(), 500);
}

#[tokio::test]
async fn test_group_by_renders_nested_cells() {
    let (_, engine) = engine().await;
    let set = engine
        .run("user.groupBy({ by: ['role'], _count: { _all: true }, orderBy: { role: 'asc' } })")
        .await
        .unwrap();

    assert_eq!(set.columns, vec!["role", "_count"]);
    let table = TableModel::from_result_set(&set, CellStyle::Compact);
    assert_eq!(
        table.rows,
        vec![
            vec!["admin".to_string(), r#"{"_all":1}"#.to_string()],
            vec!["member".to_string(), r#"{"_all":2}"#.to_string()],
        ]
    );
}

#[tokio::test]
async fn test_nested_arrays_render_as_json_text() {
    let (_, engine) = engine().await;
    let set = engine
        .run("post.findUnique({ where: { id: 1 }, select: { title: true, tags: true } })")
        .await
        .unwrap();

    let text = TableModel::from_result_set(&set, CellStyle::Compact).render_text();
    assert_eq!(
        text,
        "title │ tags\n\
         ──────┼─────────────────\n\
         Hello │ [\"intro\",\"meta\"]\n\
         \n\
         1 row(s) returned\n"
    );
}

#[tokio::test]
async fn test_demo_config_opens() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/quarry.toml");
    let config = QuarryConfig::from_file(&path).unwrap();
    let engine = Engine::open(&config).await.unwrap();
    assert_eq!(engine.registry().len(), 3);

    let set = engine.run("auditLog.count()").await.unwrap();
    assert_eq!(set.rows[0].get("value"), Some(&Cell::Number(2.into())));

    let err = engine
        .run("auditLog.delete({ where: { id: 1 } })")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownOperation);
}
