use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use storefront_client::auth::SessionObserver;
use storefront_client::config::Config;
use storefront_client::{ApiClient, Credentials};
use storefront_test::{MockApi, ADMIN_EMAIL, ADMIN_PASSWORD};

/// Remembers how often the user was sent back to the login screen.
#[derive(Debug, Default)]
pub struct Redirects {
    count: AtomicUsize,
    messages: Mutex<Vec<String>>,
}

impl Redirects {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

impl SessionObserver for Redirects {
    fn redirect_to_login(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn notify(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_owned());
    }
}

pub fn config(api: &MockApi) -> Config {
    let mut config = Config::default();
    config.api.base_url = api.base_url();
    config
}

pub fn admin() -> Credentials {
    Credentials::new(ADMIN_EMAIL, ADMIN_PASSWORD)
}

/// A client logged into `api`, reporting redirects to the returned observer.
pub async fn logged_in_client(api: &MockApi) -> (ApiClient, Arc<Redirects>) {
    let redirects = Arc::new(Redirects::default());
    let client = ApiClient::builder(config(api))
        .session_observer(redirects.clone())
        .build()
        .unwrap();
    client.login(&admin()).await.unwrap();
    (client, redirects)
}
