//! Keeps a leaderboard of top users in a sharded, in-memory database.
//!
//! Run with `cargo run -p docshard --example top_users`, `RUST_LOG=debug` for more output.

use docshard::{memory::InMemoryConnector, prelude::*};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Serialize, Deserialize, Record)]
struct TopUser {
    #[record(id)]
    #[serde(rename = "_id")]
    user_id: String,
    place: i32,
    #[serde(default)]
    hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Record)]
struct AuditEntry {
    #[serde(rename = "_id")]
    id: Option<i64>,
    message: String,
}

fn definition() -> ShardocResult<DatabaseDefinition> {
    DatabaseDefinition::builder()
        .collection(
            "top_users",
            CollectionDescriptor::builder::<TopUser>()
                .name("TopUsers")
                .index(IndexSpec::descending("place"))
                .default_filter(doc! { "hidden": false })
                .build()?,
        )
        .collection(
            "audit",
            CollectionDescriptor::builder::<AuditEntry>()
                .incremental_ids(true)
                .build()?,
        )
        .build()
}

#[tokio::main]
async fn main() -> ShardocResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DatabaseConfig::from_json(
        r#"[
            "mongodb://10.0.0.1/Example",
            { "host": "10.0.0.2", "db": "Example", "user": "app", "password": "s3cret" }
        ]"#,
    )?;

    let mut db = Database::new(definition()?, config, Arc::new(InMemoryConnector::new()))?;
    db.start().await?;

    for (user_id, place) in [("ada", 1), ("grace", 2), ("linus", 3), ("ken", 4)] {
        let shard = db.shard(user_id)?;
        let users = shard.collection::<TopUser>("top_users")?;
        users
            .save(&mut TopUser { user_id: user_id.into(), place, hidden: false })
            .await?;

        let mut entry = AuditEntry { id: None, message: format!("{} ranked {}", user_id, place) };
        shard.collection::<AuditEntry>("audit")?.save(&mut entry).await?;
        info!(user_id, shard = shard.index(), "stored user");
    }

    for shard in db.router()?.iter() {
        let users = shard.collection::<TopUser>("top_users")?;
        let podium = users
            .load(
                Filter::lte("place", 3),
                FindOptions::builder().sort("place", SortDirection::Asc).build(),
            )
            .await?;
        info!(shard = shard.index(), podium = ?podium, "podium");

        let mut streaming = users.cursor(doc! {}, CursorOptions::default()).await?;
        let everyone = streaming.next()?.try_collect::<Vec<_>>().await?;
        info!(shard = shard.index(), count = everyone.len(), "streamed users");
    }

    db.stop().await
}
