mod auth;
mod caching;
mod resources;
mod utils;
