//! Typed access to the resources of the admin API.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::ApiClient;
use crate::error::ClientError;
use crate::transport::ApiRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    Categories,
    Subcategories,
    Products,
    Cart,
    Orders,
    Coupons,
    FeaturedItems,
}

impl Resource {
    pub const ALL: [Resource; 7] = [
        Resource::Categories,
        Resource::Subcategories,
        Resource::Products,
        Resource::Cart,
        Resource::Orders,
        Resource::Coupons,
        Resource::FeaturedItems,
    ];

    /// The path of the collection, relative to the API base URL.
    pub fn path(self) -> &'static str {
        match self {
            Resource::Categories => "categories",
            Resource::Subcategories => "subcategories",
            Resource::Products => "products",
            Resource::Cart => "cart",
            Resource::Orders => "orders",
            Resource::Coupons => "coupons",
            Resource::FeaturedItems => "featured-items",
        }
    }

    /// The path of a single item of the collection.
    pub fn item_path(self, id: impl fmt::Display) -> String {
        format!("{}/{id}", self.path())
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

impl FromStr for Resource {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Resource::ALL
            .into_iter()
            .find(|resource| resource.path() == normalized)
            .ok_or_else(|| ClientError::InvalidRequest(format!("unknown resource `{s}`")))
    }
}

/// CRUD operations on one [`Resource`].
///
/// Reads go through the response cache. Every mutation invalidates the cached reads of the
/// resource, so a read following a successful update never returns the previous state.
#[derive(Clone, Copy, Debug)]
pub struct ResourceClient<'a> {
    client: &'a ApiClient,
    resource: Resource,
}

impl<'a> ResourceClient<'a> {
    pub fn new(client: &'a ApiClient, resource: Resource) -> Self {
        Self { client, resource }
    }

    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// Lists the items of the resource, filtered by the given query parameters.
    pub async fn list<I, K, V>(&self, params: I) -> Result<Value, ClientError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.list_as(params).await
    }

    pub async fn list_as<T, I, K, V>(&self, params: I) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let request = ApiRequest::get(self.resource.path()).params(params);
        self.client.json(request).await
    }

    pub async fn get(&self, id: impl fmt::Display) -> Result<Value, ClientError> {
        self.get_as(id).await
    }

    pub async fn get_as<T: DeserializeOwned>(&self, id: impl fmt::Display) -> Result<T, ClientError> {
        let request = ApiRequest::get(self.resource.item_path(id));
        self.client.json(request).await
    }

    pub async fn create(&self, body: Value) -> Result<Value, ClientError> {
        let request = ApiRequest::post(self.resource.path()).json(body);
        self.client.json(request).await
    }

    pub async fn update(&self, id: impl fmt::Display, body: Value) -> Result<Value, ClientError> {
        let request = ApiRequest::put(self.resource.item_path(id)).json(body);
        self.client.json(request).await
    }

    pub async fn delete(&self, id: impl fmt::Display) -> Result<Value, ClientError> {
        let request = ApiRequest::delete(self.resource.item_path(id));
        self.client.json(request).await
    }
}
