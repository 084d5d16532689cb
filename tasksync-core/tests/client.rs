use serde_json::json;
use tasksync_core::{
    NewTaskRow, Order, Query, StoreClient, StoreError, TASKS_TABLE, Task, TaskPatch, TaskStatus,
};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn row(id: &str, status: &str, rating: Option<u8>, created_at: &str) -> serde_json::Value {
    json!({
        "id": id,
        "user_id": "u1",
        "title": "Buy milk",
        "description": "",
        "status": status,
        "rating": rating,
        "created_at": created_at,
        "updated_at": created_at
    })
}

#[tokio::test]
async fn select_sends_filter_order_and_auth_headers() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/rest/v1/todos"))
        .and(query_param("select", "*"))
        .and(query_param("user_id", "eq.u1"))
        .and(query_param("order", "created_at.desc"))
        .and(header("apikey", "anon-key"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            row("t2", "completed", Some(5), "2024-05-02T10:00:00+00:00"),
            row("t1", "pending", None, "2024-05-01T10:00:00+00:00")
        ])))
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri(), "anon-key").unwrap();
    let query = Query::new()
        .eq("user_id", "u1")
        .order("created_at", Order::Descending);
    let tasks: Vec<Task> = client
        .select("access-1", TASKS_TABLE, &query)
        .await
        .unwrap();

    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].id, "t2");
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[0].rating, Some(5));
    assert_eq!(tasks[1].owner, "u1");
}

#[tokio::test]
async fn insert_requests_single_row_representation() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/rest/v1/todos"))
        .and(header("prefer", "return=representation"))
        .and(header("accept", "application/vnd.pgrst.object+json"))
        .and(body_json(json!({
            "user_id": "u1",
            "title": "Buy milk",
            "description": ""
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(row(
            "t1",
            "pending",
            None,
            "2024-05-01T10:00:00+00:00",
        )))
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri(), "anon-key").unwrap();
    let created: Task = client
        .insert(
            "access-1",
            TASKS_TABLE,
            &NewTaskRow {
                owner: "u1".into(),
                title: "Buy milk".into(),
                description: String::new(),
            },
        )
        .await
        .unwrap();

    assert_eq!(created.id, "t1");
    assert_eq!(created.status, TaskStatus::Pending);
}

#[tokio::test]
async fn update_patches_by_id_with_partial_body() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/todos"))
        .and(query_param("id", "eq.t1"))
        .and(body_json(json!({ "status": "completed" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(row(
            "t1",
            "completed",
            None,
            "2024-05-01T10:00:00+00:00",
        )))
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri(), "anon-key").unwrap();
    let updated: Task = client
        .update(
            "access-1",
            TASKS_TABLE,
            "t1",
            &TaskPatch::status(TaskStatus::Completed),
        )
        .await
        .unwrap();

    assert_eq!(updated.status, TaskStatus::Completed);
    assert_eq!(updated.rating, None);
}

#[tokio::test]
async fn update_without_matching_row_is_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("PATCH"))
        .and(path("/rest/v1/todos"))
        .and(query_param("id", "eq.gone"))
        .respond_with(ResponseTemplate::new(406).set_body_json(json!({
            "code": "PGRST116",
            "message": "JSON object requested, multiple (or no) rows returned"
        })))
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri(), "anon-key").unwrap();
    let result: Result<Task, _> = client
        .update("access-1", TASKS_TABLE, "gone", &TaskPatch::rating(3))
        .await;

    assert!(matches!(result, Err(StoreError::NotFound)));
}

#[tokio::test]
async fn delete_succeeds_on_no_content() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/todos"))
        .and(query_param("id", "eq.t1"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri(), "anon-key").unwrap();
    client.delete("access-1", TASKS_TABLE, "t1").await.unwrap();
}

#[tokio::test]
async fn delete_surfaces_api_errors_verbatim() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/rest/v1/todos"))
        .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
        .mount(&server)
        .await;

    let client = StoreClient::new(&server.uri(), "anon-key").unwrap();
    let err = client
        .delete("access-1", TASKS_TABLE, "t1")
        .await
        .unwrap_err();

    match err {
        StoreError::Api { status, body } => {
            assert_eq!(status.as_u16(), 403);
            assert_eq!(body, "permission denied");
        }
        other => panic!("unexpected error: {other}"),
    }
}
