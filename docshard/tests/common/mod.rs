#![allow(dead_code)]

use docshard::{memory::InMemoryConnector, prelude::*};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Record)]
pub struct UserTop {
    #[serde(rename = "_id")]
    pub user_id: String,
    pub place: i32,
}

impl UserTop {
    pub fn new(user_id: &str, place: i32) -> Self {
        Self { user_id: user_id.to_string(), place }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Record)]
pub struct Ticket {
    #[record(id)]
    #[serde(rename = "_id")]
    pub id: Option<i64>,
    pub title: String,
}

impl Ticket {
    pub fn new(title: &str) -> Self {
        Self { id: None, title: title.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Record)]
pub struct Article {
    #[serde(rename = "_id")]
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub deleted: bool,
}

pub const URI: &str = "mongodb://127.0.0.1/Example";

pub fn top_users_definition() -> DatabaseDefinition {
    DatabaseDefinition::builder()
        .collection(
            "top_users",
            CollectionDescriptor::builder::<UserTop>()
                .name("TopUsers")
                .index(IndexSpec::descending("place"))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

pub async fn started(definition: DatabaseDefinition, config: impl Into<DatabaseConfig>) -> (Database, Arc<InMemoryConnector>) {
    let connector = Arc::new(InMemoryConnector::new());
    let mut db = Database::new(definition, config, connector.clone()).unwrap();
    db.start().await.unwrap();

    (db, connector)
}
