//! Wire types of the uplink supergraph protocol. The provider's uplink client
//! and the uplink-compatible fallback responder share them, so a fallback
//! endpoint parses exactly like uplink.
use crate::types::GraphRef;
use serde::{Deserialize, Serialize};

pub const SUPERGRAPH_QUERY: &str = "query SupergraphSdl($apiKey: String!, $ref: String!, $ifAfterId: ID) { \
    routerConfig(ref: $ref, apiKey: $apiKey, ifAfterId: $ifAfterId) { \
        __typename \
        ... on RouterConfigResult { id supergraphSdl: supergraphSDL minDelaySeconds } \
        ... on Unchanged { id minDelaySeconds } \
        ... on FetchError { code message } \
    } \
}";

/// Error code used by the fallback responder for every failure.
pub const FALLBACK_ERROR_CODE: &str = "ERROR_FROM_FALLBACK";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UplinkRequest {
    #[serde(default)]
    pub query: String,
    pub variables: UplinkVariables,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UplinkVariables {
    #[serde(rename = "apiKey", default)]
    pub api_key: String,
    #[serde(rename = "ref")]
    pub graph_ref: String,
    #[serde(rename = "ifAfterId", default, skip_serializing_if = "Option::is_none")]
    pub if_after_id: Option<String>,
}

impl UplinkRequest {
    pub fn new(api_key: &str, graph_ref: &GraphRef, if_after_id: Option<&str>) -> Self {
        UplinkRequest {
            query: SUPERGRAPH_QUERY.to_string(),
            variables: UplinkVariables {
                api_key: api_key.to_string(),
                graph_ref: graph_ref.to_string(),
                if_after_id: if_after_id.map(String::from),
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UplinkResponse {
    pub data: Option<UplinkData>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphqlError>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UplinkData {
    #[serde(rename = "routerConfig")]
    pub router_config: RouterConfig,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GraphqlError {
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "__typename")]
pub enum RouterConfig {
    RouterConfigResult {
        id: String,
        #[serde(rename = "supergraphSdl")]
        supergraph_sdl: String,
        #[serde(
            rename = "minDelaySeconds",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        min_delay_seconds: Option<f64>,
    },
    Unchanged {
        id: String,
        #[serde(
            rename = "minDelaySeconds",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        min_delay_seconds: Option<f64>,
    },
    FetchError {
        code: String,
        message: String,
    },
}

impl UplinkResponse {
    pub fn router_config(router_config: RouterConfig) -> Self {
        UplinkResponse {
            data: Some(UplinkData { router_config }),
            errors: Vec::new(),
        }
    }

    pub fn fallback_error(message: impl Into<String>) -> Self {
        UplinkResponse::router_config(RouterConfig::FetchError {
            code: FALLBACK_ERROR_CODE.to_string(),
            message: message.into(),
        })
    }
}
