use serde::Deserialize;
use serde_json::json;
use storefront_client::{ClientError, Resource};
use storefront_test::{setup, MockApi};

use crate::utils::logged_in_client;

#[derive(Debug, Deserialize, PartialEq)]
struct Category {
    id: u64,
    name: String,
    status: String,
}

#[tokio::test]
async fn test_category_lifecycle() {
    setup();
    let api = MockApi::new();
    let (client, _) = logged_in_client(&api).await;
    let categories = client.resource(Resource::Categories);

    let all: Vec<Category> = categories
        .list_as(Vec::<(String, String)>::new())
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let created = categories
        .create(json!({ "name": "Bags", "status": "hidden" }))
        .await
        .unwrap();
    let id = created["id"].as_u64().unwrap();
    assert_eq!(id, 3);

    let hidden: Vec<Category> = categories.list_as([("status", "hidden")]).await.unwrap();
    let names: Vec<_> = hidden.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["Hats", "Bags"]);

    categories
        .update(id, json!({ "status": "active" }))
        .await
        .unwrap();
    let bags: Category = categories.get_as(id).await.unwrap();
    assert_eq!(
        bags,
        Category {
            id,
            name: "Bags".into(),
            status: "active".into(),
        }
    );

    categories.delete(id).await.unwrap();
    assert!(api.category(id).is_none());
    let result = categories.get(id).await;
    assert!(matches!(result, Err(ClientError::Status { status: 404, .. })));
}
