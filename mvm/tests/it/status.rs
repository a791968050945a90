use axum::body::{Body, to_bytes};
use http::Request;
use mvm::rpc::make_router;
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::Harness;

async fn getinfo(harness: &Harness, member: usize) -> Value {
    let request = Request::post("/")
        .body(Body::from(r#"{"id":"1","method":"getinfo","params":[]}"#))
        .unwrap();
    let response = make_router(harness.store(member))
        .oneshot(request)
        .await
        .unwrap();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[mvm_macros::test]
async fn getinfo_follows_the_pipeline(mut harness: Harness) {
    harness.start_group(2, 2);
    let process = harness.add_process().await;
    let event = harness.random_event(&process, 1);

    harness.deliver_event_to(&event, &[0]);
    harness.flush();
    let info = getinfo(&harness, 0).await;
    assert_eq!(info["id"], "1");
    assert_eq!(info["data"]["pending"], 1);
    assert_eq!(
        info["data"]["processes"],
        json!([{
            "id": process.id.to_string(),
            "platform": "quorum",
            "address": process.address,
            "disabled": false,
            "offset": 0,
        }])
    );

    harness.deliver_event_to(&event, &[1]);
    harness.flush();
    for member in 0..harness.len() {
        assert_eq!(getinfo(&harness, member).await["data"]["pending"], 0);
    }

    harness.machine(1).disable_process(process.id).unwrap();
    let info = getinfo(&harness, 1).await;
    assert_eq!(info["data"]["processes"][0]["disabled"], true);
}
