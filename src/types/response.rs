//! Wire shapes of GraphQL requests and responses.

use super::operation::Operation;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON body of a GraphQL request, as sent over either channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub variables: Value,
}

impl GraphqlRequest {
    pub fn new(operation: &Operation, variables: Value) -> Self {
        Self {
            query: operation.document().to_string(),
            operation_name: operation.name().map(str::to_string),
            variables,
        }
    }
}

/// Location of an error in the request document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphqlErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// An error reported by the API for an executed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphqlError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<GraphqlErrorLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphqlError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: Vec::new(),
            path: None,
            extensions: None,
        }
    }
}

/// A GraphQL response: `data`, `errors`, or both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphqlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphqlError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphqlResponse {
    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn from_errors(errors: Vec<GraphqlError>) -> Self {
        Self {
            errors,
            ..Default::default()
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}
