mod common;

use common::*;
use docshard::{collection::SEQUENCE_COLLECTION, prelude::*};
use futures::{TryStreamExt, future::join_all};

fn tickets_definition() -> DatabaseDefinition {
    DatabaseDefinition::builder()
        .collection(
            "tickets",
            CollectionDescriptor::builder::<Ticket>()
                .incremental_ids(true)
                .build()
                .unwrap(),
        )
        .collection("plain", CollectionDescriptor::builder::<Ticket>().name("tickets_plain").build().unwrap())
        .build()
        .unwrap()
}

fn articles_definition() -> DatabaseDefinition {
    DatabaseDefinition::builder()
        .collection(
            "articles",
            CollectionDescriptor::builder::<Article>()
                .default_filter(doc! { "deleted": false })
                .build()
                .unwrap(),
        )
        .collection(
            "strict",
            CollectionDescriptor::builder::<Article>().name("articles").build().unwrap(),
        )
        .collection(
            "loose",
            CollectionDescriptor::builder::<Article>()
                .name("articles")
                .strict(false)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

fn article(slug: &str, title: &str, deleted: bool) -> Article {
    Article { slug: slug.into(), title: title.into(), deleted }
}

async fn seeded_users() -> (Database, TypedCollection<UserTop>) {
    let (db, _) = started(top_users_definition(), URI).await;
    let users = db.collection::<UserTop>("top_users").unwrap();
    let mut batch = vec![
        UserTop::new("ada", 1),
        UserTop::new("grace", 2),
        UserTop::new("linus", 3),
        UserTop::new("ken", 4),
    ];
    users.save_many(&mut batch).await.unwrap();

    (db, users)
}

#[tokio::test]
async fn cursor_streams_the_same_records_as_load() {
    let (_db, users) = seeded_users().await;
    let options = FindOptions::builder().sort("place", SortDirection::Asc).build();

    let loaded = users.load(doc! {}, options.clone()).await.unwrap();

    let mut open = users
        .cursor(doc! {}, CursorOptions { find: options, ..Default::default() })
        .await
        .unwrap();
    assert!(open.alive());
    assert!(!users.alive());

    let streamed = open.next().unwrap().try_collect::<Vec<_>>().await.unwrap();
    assert_eq!(streamed, loaded);
    assert_eq!(streamed.len(), 4);

    assert!(!open.alive());
    assert!(matches!(open.next(), Err(ShardocError::State(_))));
}

#[tokio::test]
async fn load_is_refused_while_a_cursor_is_open() {
    let (_db, users) = seeded_users().await;
    let mut open = users.cursor(Filter::lte("place", 2), CursorOptions::default()).await.unwrap();

    assert!(matches!(
        open.load(doc! {}, FindOptions::default()).await,
        Err(ShardocError::State(_))
    ));

    // load_one pulls from the open cursor, then falls back to queries once it is drained
    let sorted = FindOptions::builder().sort("place", SortDirection::Desc).build();
    assert!(open.load_one(doc! {}, sorted.clone()).await.unwrap().is_some());
    assert!(open.load_one(doc! {}, sorted.clone()).await.unwrap().is_some());
    assert!(open.load_one(doc! {}, sorted.clone()).await.unwrap().is_none());
    assert!(!open.alive());

    let last = open.load_one(doc! {}, sorted).await.unwrap().unwrap();
    assert_eq!(last.user_id, "ken");
    assert_eq!(open.load(doc! {}, FindOptions::default()).await.unwrap().len(), 4);
}

#[tokio::test]
async fn cursor_option_is_rejected_on_one_shot_reads() {
    let (_db, mut users) = seeded_users().await;
    let options = FindOptions::builder().extra("cursor", true).build();

    assert!(matches!(users.load(doc! {}, options.clone()).await, Err(ShardocError::State(_))));
    assert!(matches!(users.load_one(doc! {}, options).await, Err(ShardocError::State(_))));
}

#[tokio::test]
async fn derived_options_are_dropped_not_honoured() {
    let (_db, users) = seeded_users().await;
    let options = FindOptions::builder()
        .projection(doc! { "place": 0 })
        .extra("filter", doc! { "place": 1 })
        .build();

    let loaded = users.load(doc! {}, options).await.unwrap();
    assert_eq!(loaded.len(), 4);
    assert!(loaded.iter().all(|user| user.place > 0));
}

#[tokio::test]
async fn load_honours_sort_skip_and_limit() {
    let (_db, users) = seeded_users().await;
    let options = FindOptions::builder()
        .sort("place", SortDirection::Desc)
        .skip(1)
        .limit(2)
        .build();

    let places = users
        .load(doc! {}, options)
        .await
        .unwrap()
        .into_iter()
        .map(|user| user.place)
        .collect::<Vec<_>>();
    assert_eq!(places, vec![3, 2]);
}

#[tokio::test]
async fn filter_expressions_select_records() {
    let (_db, users) = seeded_users().await;

    let middle = Filter::gt("place", 1).and(Filter::lt("place", 4));
    assert_eq!(users.count(middle).await.unwrap(), 2);

    let named = Filter::any_of("_id", ["ada", "ken"]);
    assert_eq!(users.count(named).await.unwrap(), 2);

    let others = Filter::none_of("_id", ["ada", "ken"]).or(Filter::eq("place", 1));
    assert_eq!(users.count(others).await.unwrap(), 3);

    assert_eq!(users.count(Filter::eq("place", 2).not()).await.unwrap(), 3);
    assert_eq!(users.count(Filter::not_exists("place")).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_saves_allocate_distinct_identifiers() {
    let (db, _) = started(tickets_definition(), URI).await;
    let tickets = db.collection::<Ticket>("tickets").unwrap();

    let mut batch = (0..20).map(|i| Ticket::new(&format!("ticket {}", i))).collect::<Vec<_>>();
    let results = join_all(batch.iter_mut().map(|ticket| tickets.save(ticket))).await;
    assert!(results.into_iter().all(|result| result.is_ok()));

    let mut ids = batch.iter().map(|ticket| ticket.id.unwrap()).collect::<Vec<_>>();
    ids.sort_unstable();
    assert_eq!(ids, (1..=20).collect::<Vec<i64>>());
    assert_eq!(tickets.count(doc! {}).await.unwrap(), 20);
}

#[tokio::test]
async fn save_many_allocates_only_missing_identifiers() {
    let (db, _) = started(tickets_definition(), URI).await;
    let tickets = db.collection::<Ticket>("tickets").unwrap();

    assert_eq!(tickets.next_id().await.unwrap(), Bson::Int64(1));

    let mut batch = vec![
        Ticket::new("a"),
        Ticket { id: Some(100), title: "b".into() },
        Ticket::new("c"),
    ];
    tickets.save_many(&mut batch).await.unwrap();

    let mut allocated = vec![batch[0].id.unwrap(), batch[2].id.unwrap()];
    allocated.sort_unstable();
    assert_eq!(allocated, vec![2, 3]);
    assert_eq!(batch[1].id, Some(100));
    assert_eq!(tickets.next_id().await.unwrap(), Bson::Int64(4));

    tickets.save_many(&mut []).await.unwrap();
    assert_eq!(tickets.count(doc! {}).await.unwrap(), 3);
}

#[tokio::test]
async fn next_id_requires_incremental_collections() {
    let (db, _) = started(tickets_definition(), URI).await;
    let plain = db.collection::<Ticket>("plain").unwrap();

    assert!(matches!(plain.next_id().await, Err(ShardocError::Configuration(_))));

    // the backend assigns its own identifier
    let mut ticket = Ticket::new("no id");
    plain.save(&mut ticket).await.unwrap();
    assert_eq!(ticket.id, None);
    assert_eq!(plain.count(doc! {}).await.unwrap(), 1);
}

#[tokio::test]
async fn counters_are_kept_per_logical_collection() {
    let (db, _) = started(tickets_definition(), URI).await;
    let tickets = db.collection::<Ticket>("tickets").unwrap();
    tickets.next_id().await.unwrap();
    tickets.next_id().await.unwrap();

    let counter = tickets
        .raw()
        .backend()
        .find_one(SEQUENCE_COLLECTION, doc! { "_id": "tickets" }, FindOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(counter.get_i64("seq").unwrap(), 2);
}

#[tokio::test]
async fn default_filter_scopes_queries_unless_overridden() {
    let (db, _) = started(articles_definition(), URI).await;
    let articles = db.collection::<Article>("articles").unwrap();

    let mut batch = vec![article("a", "Alive", false), article("b", "Gone", true)];
    articles.save_many(&mut batch).await.unwrap();

    assert_eq!(articles.count(doc! {}).await.unwrap(), 1);
    assert_eq!(articles.load(doc! {}, FindOptions::default()).await.unwrap()[0].slug, "a");

    let deleted = articles.load(Filter::eq("deleted", true), FindOptions::default()).await.unwrap();
    assert_eq!(deleted, vec![article("b", "Gone", true)]);

    assert_eq!(articles.find(doc! {}, FindOptions::default()).await.unwrap().len(), 1);
    assert!(articles.find_one(doc! { "_id": "b" }, FindOptions::default()).await.unwrap().is_none());
}

#[tokio::test]
async fn strictness_decides_unknown_field_handling() {
    let (db, _) = started(articles_definition(), URI).await;
    let strict = db.collection::<Article>("strict").unwrap();
    let loose = db.collection::<Article>("loose").unwrap();

    strict
        .raw()
        .insert_one(doc! { "_id": "x", "title": "Extra", "deleted": false, "views": 10 })
        .await
        .unwrap();

    // typed reads project declared fields, raw reads do not
    assert_eq!(strict.load(doc! {}, FindOptions::default()).await.unwrap().len(), 1);
    let raw = strict.find_one(doc! {}, FindOptions::default()).await.unwrap().unwrap();
    assert!(matches!(Article::decode(raw.clone(), true), Err(ShardocError::Decode(_))));
    assert_eq!(Article::decode(raw, false).unwrap(), article("x", "Extra", false));

    assert_eq!(loose.load(doc! {}, FindOptions::default()).await.unwrap(), vec![article("x", "Extra", false)]);
}

#[tokio::test]
async fn type_mismatches_fail_to_decode() {
    let (db, _) = started(articles_definition(), URI).await;
    let loose = db.collection::<Article>("loose").unwrap();

    loose.raw().insert_one(doc! { "_id": "x", "title": 42 }).await.unwrap();

    assert!(matches!(
        loose.load(doc! {}, FindOptions::default()).await,
        Err(ShardocError::Decode(_))
    ));
}

#[tokio::test]
async fn store_upserts_then_modifies() {
    let (db, _) = started(articles_definition(), URI).await;
    let articles = db.collection::<Article>("articles").unwrap();

    let draft = article("post", "Draft", false);
    let upsert = || StoreOptions { upsert: true, ..Default::default() };

    assert_eq!(articles.store(doc! { "_id": "post" }, &draft, upsert()).await.unwrap(), 0);
    assert_eq!(articles.count(doc! {}).await.unwrap(), 1);

    let published = article("post", "Published", false);
    assert_eq!(articles.store(doc! { "_id": "post" }, &published, upsert()).await.unwrap(), 1);
    assert_eq!(articles.load(doc! {}, FindOptions::default()).await.unwrap(), vec![published.clone()]);

    // storing identical values modifies nothing
    assert_eq!(
        articles.store(doc! { "_id": "post" }, &published, StoreOptions::default()).await.unwrap(),
        0
    );
    assert_eq!(
        articles.store(doc! { "_id": "missing" }, &published, StoreOptions::default()).await.unwrap(),
        0
    );
    assert_eq!(articles.count(doc! {}).await.unwrap(), 1);
}

#[tokio::test]
async fn store_many_updates_each_record_by_identifier() {
    let (db, _) = started(articles_definition(), URI).await;
    let articles = db.collection::<Article>("articles").unwrap();

    let mut batch = vec![article("a", "One", false), article("b", "Two", false), article("c", "Three", false)];
    articles.save_many(&mut batch).await.unwrap();

    let edits = vec![article("a", "One!", false), article("c", "Three!", false)];
    assert_eq!(articles.store_many(doc! {}, &edits, StoreOptions::default()).await.unwrap(), 2);

    let titles = articles
        .load(doc! {}, FindOptions::builder().sort("_id", SortDirection::Asc).build())
        .await
        .unwrap()
        .into_iter()
        .map(|article| article.title)
        .collect::<Vec<_>>();
    assert_eq!(titles, vec!["One!", "Two", "Three!"]);
}

#[tokio::test]
async fn store_runs_inside_a_session() {
    let (db, _) = started(articles_definition(), URI).await;
    let articles = db.collection::<Article>("articles").unwrap();
    articles.save(&mut article("a", "One", false)).await.unwrap();

    let mut session = articles.raw().backend().start_session().await.unwrap();
    session.start_transaction().await.unwrap();

    let modified = articles
        .store(
            doc! { "_id": "a" },
            &article("a", "Uno", false),
            StoreOptions { session: Some(session.as_mut()), ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(modified, 1);

    session.commit_transaction().await.unwrap();
    assert!(matches!(session.commit_transaction().await, Err(ShardocError::State(_))));
}

#[tokio::test]
async fn bulk_save_reports_partial_failures() {
    let (db, _) = started(articles_definition(), URI).await;
    let articles = db.collection::<Article>("articles").unwrap();
    articles.save(&mut article("b", "Existing", false)).await.unwrap();

    let mut batch = vec![article("a", "One", false), article("b", "Clash", false), article("c", "Three", false)];
    let err = articles.save_many(&mut batch).await.unwrap_err();

    assert!(matches!(err, ShardocError::BulkWrite { inserted: 2, failed: 1, .. }));
    assert_eq!(articles.count(doc! {}).await.unwrap(), 3);
}
