//! gatewayapi-operator: derives shared Gateway API Gateways from HTTPRoutes

pub mod aggregate;
pub mod config;
pub mod controllers;
pub mod gateway;
pub mod health;
pub mod listener;
pub mod resources;
pub mod route;
pub mod store;
pub mod validate;

#[cfg(test)]
mod test_utils;

pub use config::OperatorConfig;
pub use resources::{Gateway, HTTPRoute};
