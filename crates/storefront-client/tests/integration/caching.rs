use std::time::Duration;

use futures::future::join_all;
use serde_json::{json, Value};
use storefront_client::ApiRequest;
use storefront_test::{setup, MockApi};

use crate::utils::logged_in_client;

#[tokio::test]
async fn test_concurrent_reads_hit_the_api_once() {
    setup();
    let api = MockApi::new();
    api.set_latency(Duration::from_millis(50));
    let (client, _) = logged_in_client(&api).await;

    let request = ApiRequest::get("categories").param("status", "active");
    let responses = join_all((0..3).map(|_| client.json::<Value>(request.clone()))).await;

    for response in responses {
        let categories = response.unwrap();
        assert_eq!(categories, json!([{ "id": 1, "name": "Shoes", "status": "active" }]));
    }
    assert_eq!(api.hits("GET /api/categories"), 1);
    assert_eq!(api.hits("GET /api/auth/validate"), 1);

    // and from the cache afterwards
    client.json::<Value>(request).await.unwrap();
    assert_eq!(api.hits("GET /api/categories"), 1);
}

#[tokio::test]
async fn test_update_invalidates_cached_reads() {
    setup();
    let api = MockApi::new();
    let (client, _) = logged_in_client(&api).await;

    let list = ApiRequest::get("categories").param("status", "active");
    let before: Value = client.json(list.clone()).await.unwrap();
    assert_eq!(before[0]["name"], "Shoes");

    let products = ApiRequest::get("products");
    client.send(products.clone()).await.unwrap();

    client
        .put("categories/1", json!({ "name": "Sneakers" }))
        .await
        .unwrap();

    let after: Value = client.json(list).await.unwrap();
    assert_eq!(after[0]["name"], "Sneakers");
    assert_eq!(api.hits("GET /api/categories"), 2);

    // other resources stay cached
    client.send(products).await.unwrap();
    assert_eq!(api.hits("GET /api/products"), 1);
}

#[tokio::test]
async fn test_no_cache_reads_always_hit_the_api() {
    setup();
    let api = MockApi::new();
    let (client, _) = logged_in_client(&api).await;

    for _ in 0..2 {
        client
            .send(ApiRequest::get("categories/2").no_cache())
            .await
            .unwrap();
    }

    assert_eq!(api.hits("GET /api/categories/2"), 2);
    let cached = client.cache().get(&ApiRequest::get("categories/2").key()).await;
    assert!(cached.is_none());
}
