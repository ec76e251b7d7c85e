use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resource::{NoTransition, Resource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Resource for Namespace {
    type Transition = NoTransition;
    const KIND: &'static str = "namespaces";

    fn uid(&self) -> &str {
        &self.id
    }
}
