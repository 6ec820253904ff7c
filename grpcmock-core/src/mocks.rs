use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// A mock reply registered for one method, keyed by full method path.
///
/// `grpc_status != 0` produces an error status instead of a body;
/// `response_type` optionally overrides the method's output type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MockConfig {
    pub service: String,
    pub method: String,
    pub response_type: String,
    pub mock_response: serde_json::Value,
    pub grpc_status: i32,
    pub error_string: String,
    pub headers: HashMap<String, String>,
    pub delay_ms: u64,
}

impl MockConfig {
    /// The routing key: `"/<service>/<method>"`.
    pub fn method_path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// Stores mock configurations, concurrent read-mostly.
#[derive(Default)]
pub struct MockRegistry {
    mocks: RwLock<HashMap<String, MockConfig>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a mock under its method path, last-writer-wins.
    pub fn register(&self, config: MockConfig) {
        let path = config.method_path();
        let mut mocks = self.mocks.write().expect("mock registry lock poisoned");
        mocks.insert(path, config);
    }

    pub fn get(&self, method_path: &str) -> Option<MockConfig> {
        let mocks = self.mocks.read().expect("mock registry lock poisoned");
        mocks.get(method_path).cloned()
    }
}
