use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use storefront_client::auth::SESSION_EXPIRED_MESSAGE;
use storefront_client::{ApiClient, ApiRequest, ClientError, Credentials, TokenStatus};
use storefront_test::{setup, tempdir, MockApi, ADMIN_EMAIL};

use crate::utils::{admin, config, logged_in_client, Redirects};

#[tokio::test]
async fn test_requests_require_login() {
    setup();
    let api = MockApi::new();
    let client = ApiClient::builder(config(&api)).build().unwrap();

    assert_eq!(
        client.get("categories").await,
        Err(ClientError::NotAuthenticated)
    );
    assert_eq!(api.accesses(), 0);
}

#[tokio::test]
async fn test_wrong_password() {
    setup();
    let api = MockApi::new();
    let client = ApiClient::builder(config(&api)).build().unwrap();

    let result = client
        .login(&Credentials::new(ADMIN_EMAIL, "hunter2"))
        .await;

    assert!(matches!(result, Err(ClientError::Status { status: 401, .. })));
    assert!(!client.tokens().is_authenticated());
}

#[tokio::test]
async fn test_expired_token_is_refreshed_once() {
    setup();
    let api = MockApi::new();
    api.set_latency(Duration::from_millis(50));
    let (client, redirects) = logged_in_client(&api).await;
    api.expire_access_tokens();

    let paths = ["categories/1", "categories/2", "products"];
    let responses = join_all(paths.iter().map(|path| client.get(path))).await;

    for response in responses {
        assert_eq!(response.unwrap().status, 200);
    }
    assert_eq!(api.hits("GET /api/auth/validate"), 1);
    assert_eq!(api.hits("POST /api/auth/refresh"), 1);
    assert_eq!(client.tokens().status(), TokenStatus::Valid);
    assert_eq!(redirects.count(), 0);
}

#[tokio::test]
async fn test_failed_refresh_ends_session() {
    setup();
    let api = MockApi::new();
    api.set_latency(Duration::from_millis(50));
    let (client, redirects) = logged_in_client(&api).await;
    client.get("categories").await.unwrap();

    api.expire_access_tokens();
    api.revoke_refresh_tokens();

    let paths = ["categories/1", "categories/2", "products"];
    let responses = join_all(paths.iter().map(|path| client.get(path))).await;

    for response in responses {
        assert_eq!(response, Err(ClientError::AuthenticationExpired));
    }
    assert_eq!(api.hits("POST /api/auth/refresh"), 1);
    assert_eq!(redirects.count(), 1);
    assert_eq!(redirects.messages(), [SESSION_EXPIRED_MESSAGE]);
    assert_eq!(client.tokens().status(), TokenStatus::Invalid);

    // the previously cached read went with the session
    let cached = client.cache().get(&ApiRequest::get("categories").key()).await;
    assert!(cached.is_none());

    // no more round trips until somebody logs in again
    let accesses = api.accesses();
    assert_eq!(
        client.get("categories").await,
        Err(ClientError::AuthenticationExpired)
    );
    assert_eq!(api.accesses(), accesses);

    client.login(&admin()).await.unwrap();
    client.get("categories").await.unwrap();
    assert_eq!(redirects.count(), 1);
}

#[tokio::test]
async fn test_session_survives_restart() {
    setup();
    let api = MockApi::new();
    let session_dir = tempdir();
    let mut config = config(&api);
    config.session_file = Some(session_dir.path().join("session.json"));

    let client = ApiClient::builder(config.clone()).build().unwrap();
    client.login(&admin()).await.unwrap();
    drop(client);

    let redirects = Arc::new(Redirects::default());
    let client = ApiClient::builder(config.clone())
        .session_observer(redirects.clone())
        .build()
        .unwrap();
    assert!(client.tokens().is_authenticated());
    client.get("categories").await.unwrap();

    client.logout();
    let client = ApiClient::builder(config).build().unwrap();
    assert!(!client.tokens().is_authenticated());
    assert_eq!(redirects.count(), 0);
}
