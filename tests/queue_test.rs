//! Queue semantics against a real PostgreSQL instance.
//!
//! These tests need a live database and are ignored by default; point
//! `DATABASE_URL` at a scratch database and run with `--ignored`. Each test
//! works on its own uuids, so a shared database is fine.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use omero_adi::database::Migrator;
use omero_adi::models::NewOrder;
use omero_adi::state_machine::Stage;
use omero_adi::tracker::IngestTracker;

async fn tracker() -> IngestTracker {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a scratch database");
    let pool = PgPool::connect(&url).await.expect("connect");
    Migrator::default().run(&pool).await.expect("migrate");
    IngestTracker::new(pool)
}

fn order(uuid: Uuid, files: Vec<String>) -> NewOrder {
    NewOrder {
        uuid,
        group_name: "Demo".into(),
        user_name: "researcher".into(),
        destination_id: "151".into(),
        destination_type: "Dataset".into(),
        files,
        file_names: None,
        preprocessing: None,
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn claim_is_fifo_and_exactly_once() {
    let tracker = tracker().await;

    let uuids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    for uuid in &uuids {
        tracker
            .insert_new_order(&order(*uuid, vec!["/data/g/x.tif".into()]))
            .await
            .unwrap();
    }

    let mut claimed = Vec::new();
    while let Some(record) = tracker.claim_next().await.unwrap() {
        if uuids.contains(&record.uuid) {
            claimed.push(record.uuid);
        }
        if claimed.len() == uuids.len() {
            break;
        }
    }

    // FIFO by insertion time.
    assert_eq!(claimed, uuids);
    for uuid in &uuids {
        assert_eq!(
            tracker.current_stage(*uuid).await.unwrap(),
            Some(Stage::ImportStarted)
        );
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn concurrent_claimers_never_share_an_order() {
    let tracker = Arc::new(tracker().await);

    let uuids: Vec<Uuid> = (0..20).map(|_| Uuid::new_v4()).collect();
    for uuid in &uuids {
        tracker
            .insert_new_order(&order(*uuid, vec!["/data/g/x.tif".into()]))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let tracker = Arc::clone(&tracker);
        let mine: Vec<Uuid> = uuids.clone();
        handles.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(record) = tracker.claim_next().await.unwrap() {
                if mine.contains(&record.uuid) {
                    got.push(record.uuid);
                }
            }
            got
        }));
    }

    let mut all: Vec<Uuid> = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    all.sort();
    let mut expected = uuids.clone();
    expected.sort();
    // Every order claimed exactly once across all claimers.
    assert_eq!(all, expected);
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn stage_machine_is_enforced_at_the_log() {
    let tracker = tracker().await;
    let uuid = Uuid::new_v4();
    tracker
        .insert_new_order(&order(uuid, vec!["/data/g/x.tif".into()]))
        .await
        .unwrap();

    // Completion before a claim violates the machine.
    assert!(tracker
        .record(uuid, Stage::ImportCompleted, None)
        .await
        .is_err());

    let claimed = tracker.claim_next().await.unwrap();
    assert!(claimed.is_some());

    tracker
        .record(uuid, Stage::ImportCompleted, None)
        .await
        .unwrap();

    // Terminal stages never transition out.
    assert!(tracker
        .record(uuid, Stage::ImportFailed, Some("late"))
        .await
        .is_err());
    assert_eq!(
        tracker.current_stage(uuid).await.unwrap(),
        Some(Stage::ImportCompleted)
    );
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn dangling_orders_fail_once_at_startup() {
    let tracker = tracker().await;
    let uuid = Uuid::new_v4();
    tracker
        .insert_new_order(&order(uuid, vec!["/data/g/x.tif".into()]))
        .await
        .unwrap();
    tracker.claim_next().await.unwrap().unwrap();

    // Simulated restart: the claim has no worker behind it any more.
    let dangling = tracker.list_dangling().await.unwrap();
    assert!(dangling.contains(&uuid));

    // Two instances may boot together; recovery must tolerate the other
    // one winning the race for any given uuid.
    let (first, second) = tokio::join!(
        omero_adi::orchestration::bootstrap::recover_dangling_orders(&tracker),
        omero_adi::orchestration::bootstrap::recover_dangling_orders(&tracker),
    );
    first.unwrap();
    second.unwrap();

    assert_eq!(
        tracker.current_stage(uuid).await.unwrap(),
        Some(Stage::ImportFailed)
    );
    assert!(!tracker.list_dangling().await.unwrap().contains(&uuid));

    // Exactly one terminal event was written for the recovered order.
    let failed_events: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM imports WHERE uuid = $1 AND stage = 'Import Failed'",
    )
    .bind(uuid)
    .fetch_one(tracker.pool())
    .await
    .unwrap();
    assert_eq!(failed_events, 1);
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn files_survive_the_event_chain_verbatim() {
    let tracker = tracker().await;
    let uuid = Uuid::new_v4();
    let files = vec!["/data/g/α plate.db".to_string(), "/data/g/x.tif".to_string()];
    tracker
        .insert_new_order(&order(uuid, files.clone()))
        .await
        .unwrap();

    let claimed = tracker.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.files.0, files);

    let done = tracker
        .record(uuid, Stage::ImportCompleted, None)
        .await
        .unwrap();
    assert_eq!(done.files.0, files);
}

#[tokio::test]
#[ignore = "requires PostgreSQL (set DATABASE_URL)"]
async fn preprocessing_row_is_linked_and_loadable() {
    let tracker = tracker().await;
    let uuid = Uuid::new_v4();

    let mut extra = serde_json::Map::new();
    extra.insert("saveoption".into(), serde_json::json!("single"));

    let mut new_order = order(uuid, vec!["/data/g/plate.db".into()]);
    new_order.destination_type = "Screen".into();
    new_order.preprocessing = Some(omero_adi::models::preprocessing::NewPreprocessing {
        container: "conv:latest".into(),
        input_file: "{Files}".into(),
        output_folder: "/data".into(),
        alt_output_folder: Some("/out".into()),
        extra_params: Some(extra),
    });

    let record = tracker.insert_new_order(&new_order).await.unwrap();
    let preprocessing_id = record.preprocessing_id.expect("linked preprocessing row");

    let spec = tracker
        .load_preprocessing(preprocessing_id)
        .await
        .unwrap()
        .expect("row exists");
    assert_eq!(spec.container, "conv:latest");
    assert_eq!(
        spec.extra_params_vec(),
        vec![("saveoption".to_string(), "single".to_string())]
    );
}
