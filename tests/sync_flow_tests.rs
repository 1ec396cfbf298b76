//! 变更日志 → 表格同步的端到端测试（内存表格）

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use letter_sync_lib::change_log::ChangeLogRepo;
use letter_sync_lib::config::AppConfig;
use letter_sync_lib::database::LetterDatabase;
use letter_sync_lib::error::{SheetResult, SyncError};
use letter_sync_lib::letter_repo::LetterRepo;
use letter_sync_lib::models::{
    ChangeAction, CreateLetterParams, LetterChanges, LetterStatus, SyncRunResult, SyncState,
};
use letter_sync_lib::sheets::{AppendOutcome, MemorySheetStore, RowUpdate, SheetStore};
use letter_sync_lib::sync::{SheetReconciler, SyncOptions, SyncScheduler};

struct TestEnv {
    _temp_dir: TempDir,
    db: Arc<LetterDatabase>,
    store: Arc<MemorySheetStore>,
    reconciler: SheetReconciler,
}

fn setup_with_store(store: MemorySheetStore) -> TestEnv {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Arc::new(LetterDatabase::new(temp_dir.path()).expect("Failed to create database"));
    let store = Arc::new(store);
    let dyn_store: Arc<dyn SheetStore> = store.clone();
    let reconciler = SheetReconciler::new(db.clone(), Some(dyn_store), SyncOptions::default());
    TestEnv {
        _temp_dir: temp_dir,
        db,
        store,
        reconciler,
    }
}

fn setup() -> TestEnv {
    setup_with_store(MemorySheetStore::new())
}

fn header() -> Vec<String> {
    letter_sync_lib::sheets::layout::COLUMNS
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn params(id: &str, number: &str) -> CreateLetterParams {
    CreateLetterParams {
        id: Some(id.to_string()),
        number: number.to_string(),
        org: "Департамент ЖКХ".to_string(),
        date: Utc.with_ymd_and_hms(2024, 9, 12, 8, 0, 0).unwrap(),
        status: LetterStatus::New,
        ..Default::default()
    }
}

fn history(env: &TestEnv, letter_id: &str) -> Vec<letter_sync_lib::ChangeLogRecord> {
    let conn = env.db.get_conn().unwrap();
    ChangeLogRepo::list_for_letter(&conn, letter_id).unwrap()
}

#[tokio::test]
async fn test_create_update_sync_then_idle() {
    let env = setup();

    LetterRepo::create_letter(&env.db, params("L1", "101/24"), Some("u0")).unwrap();
    assert_eq!(history(&env, "L1").len(), 1);

    LetterRepo::update_letter(
        &env.db,
        "L1",
        LetterChanges {
            status: Some(LetterStatus::InProgress),
            owner_id: Some(Some("u1".to_string())),
            ..Default::default()
        },
        Some("u0"),
    )
    .unwrap();

    let records = history(&env, "L1");
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].action, ChangeAction::Create);
    assert_eq!(records[1].action, ChangeAction::Update);
    assert_eq!(records[1].field_name.as_deref(), Some("status"));
    assert_eq!(records[1].old_value.as_deref(), Some("NEW"));
    assert_eq!(records[1].new_value.as_deref(), Some("IN_PROGRESS"));
    assert_eq!(records[2].field_name.as_deref(), Some("owner_id"));
    assert_eq!(records[2].old_value, None);
    assert_eq!(records[2].new_value.as_deref(), Some("u1"));

    let result = env.reconciler.run_batch(50).await;
    assert_eq!(
        result,
        SyncRunResult {
            processed: 3,
            synced: 3,
            failed: 0,
            errors: vec![],
        }
    );

    // 三条记录只追加一行
    assert_eq!(env.store.append_calls(), 1);
    assert_eq!(env.store.rows().len(), 2);
    let row = env.store.row(2).expect("appended row");
    assert_eq!(row[0], "L1");
    assert_eq!(row[1], "101/24");
    assert_eq!(row[5], "IN_PROGRESS");
    assert_eq!(row[6], "u1");
    assert!(env.store.formatted_ranges().is_empty());

    let letter = LetterRepo::get_letter(&env.db, "L1").unwrap().unwrap();
    assert_eq!(letter.sheet_row, Some(2));
    assert!(letter.last_synced_at.is_some());
    assert!(history(&env, "L1")
        .iter()
        .all(|r| r.sync_status == SyncState::Synced && r.synced_at.is_some()));

    // 同步簿记不产生新记录，第二次为空操作
    let second = env.reconciler.run_batch(50).await;
    assert_eq!(second, SyncRunResult::default());
    assert_eq!(env.store.append_calls(), 1);
}

#[tokio::test]
async fn test_multi_field_update_yields_one_record_per_field() {
    let env = setup();
    LetterRepo::create_letter(&env.db, params("L1", "7"), None).unwrap();

    LetterRepo::update_letter(
        &env.db,
        "L1",
        LetterChanges {
            org: Some("Прокуратура".to_string()),
            priority: Some(2),
            content: Some(Some("Запрос сведений".to_string())),
            tags: Some(vec!["urgent".to_string()]),
            ..Default::default()
        },
        None,
    )
    .unwrap();

    let updates: Vec<_> = history(&env, "L1")
        .into_iter()
        .filter(|r| r.action == ChangeAction::Update)
        .collect();
    let fields: Vec<_> = updates
        .iter()
        .map(|r| r.field_name.clone().unwrap_or_default())
        .collect();
    assert_eq!(fields, vec!["org", "priority", "content", "tags"]);
}

#[tokio::test]
async fn test_soft_delete_syncs_as_deleted_status() {
    let env = setup();
    LetterRepo::create_letter(&env.db, params("L1", "9"), None).unwrap();
    env.reconciler.run_batch(50).await;

    LetterRepo::soft_delete_letter(&env.db, "L1", Some("admin")).unwrap();
    let records = history(&env, "L1");
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].action, ChangeAction::Delete);
    assert!(records.iter().all(|r| r.action != ChangeAction::Update));

    // 再次软删除不产生记录
    LetterRepo::soft_delete_letter(&env.db, "L1", Some("admin")).unwrap();
    assert_eq!(history(&env, "L1").len(), 2);

    let result = env.reconciler.run_batch(50).await;
    assert_eq!(result.synced, 1);
    assert_eq!(env.store.update_calls(), 1);
    assert_eq!(env.store.row(2).unwrap()[5], "DELETED");
}

#[tokio::test]
async fn test_hard_deleted_letter_is_marked_synced_without_write() {
    let env = setup();
    LetterRepo::create_letter(&env.db, params("L1", "9"), None).unwrap();
    assert!(LetterRepo::hard_delete_letter(&env.db, "L1", None).unwrap());

    let records = history(&env, "L1");
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].action, ChangeAction::Delete);

    let result = env.reconciler.run_batch(50).await;
    assert_eq!(result.processed, 2);
    assert_eq!(result.synced, 2);
    assert_eq!(env.store.append_calls(), 0);
    assert_eq!(env.store.update_calls(), 0);
}

#[tokio::test]
async fn test_existing_remote_row_is_updated_in_place() {
    let mut other = vec![String::new(); header().len()];
    other[0] = "X9".to_string();
    let mut stale = vec![String::new(); header().len()];
    stale[0] = "L1".to_string();
    stale[1] = "old".to_string();
    let env = setup_with_store(MemorySheetStore::with_rows(vec![header(), other, stale]));

    LetterRepo::create_letter(&env.db, params("L1", "55/2"), None).unwrap();
    let result = env.reconciler.run_batch(50).await;

    assert_eq!(result.synced, 1);
    assert_eq!(env.store.append_calls(), 0);
    assert_eq!(env.store.update_calls(), 1);
    assert_eq!(env.store.row(3).unwrap()[1], "55/2");
    assert_eq!(env.store.row(2).unwrap()[0], "X9");

    let letter = LetterRepo::get_letter(&env.db, "L1").unwrap().unwrap();
    assert_eq!(letter.sheet_row, Some(3));
}

#[tokio::test]
async fn test_later_changes_update_the_cached_row() {
    let env = setup();
    LetterRepo::create_letter(&env.db, params("L1", "1"), None).unwrap();
    LetterRepo::create_letter(&env.db, params("L2", "2"), None).unwrap();
    env.reconciler.run_batch(50).await;
    assert_eq!(env.store.rows().len(), 3);

    LetterRepo::update_letter(
        &env.db,
        "L2",
        LetterChanges {
            priority: Some(3),
            ..Default::default()
        },
        None,
    )
    .unwrap();
    let result = env.reconciler.run_batch(50).await;

    assert_eq!(result.synced, 1);
    assert_eq!(env.store.append_calls(), 1);
    assert_eq!(env.store.rows().len(), 3);
    assert_eq!(env.store.row(3).unwrap()[8], "3");
}

#[tokio::test]
async fn test_appended_block_gets_template_format() {
    let env = setup();
    LetterRepo::create_letter(&env.db, params("L1", "1"), None).unwrap();
    env.reconciler.run_batch(50).await;

    LetterRepo::create_letter(&env.db, params("L2", "2"), None).unwrap();
    LetterRepo::create_letter(&env.db, params("L3", "3"), None).unwrap();
    env.reconciler.run_batch(50).await;

    assert_eq!(env.store.formatted_ranges(), vec![(2, 3, 2)]);
    let l3 = LetterRepo::get_letter(&env.db, "L3").unwrap().unwrap();
    assert_eq!(l3.sheet_row, Some(4));
}

#[tokio::test]
async fn test_format_failure_does_not_fail_letters() {
    let env = setup();
    LetterRepo::create_letter(&env.db, params("L1", "1"), None).unwrap();
    env.reconciler.run_batch(50).await;

    env.store.set_fail_formats(true);
    LetterRepo::create_letter(&env.db, params("L2", "2"), None).unwrap();
    let result = env.reconciler.run_batch(50).await;
    assert_eq!(result.synced, 1);
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn test_stale_cached_row_falls_back_to_append() {
    let mut other = vec![String::new(); header().len()];
    other[0] = "OTHER".to_string();
    let env = setup_with_store(MemorySheetStore::with_rows(vec![header(), other]));

    LetterRepo::create_letter(&env.db, params("L1", "1"), None).unwrap();
    {
        let conn = env.db.get_conn().unwrap();
        LetterRepo::set_sheet_row(&conn, "L1", 2, &Utc::now()).unwrap();
    }

    let result = env.reconciler.run_batch(50).await;
    assert_eq!(result.synced, 1);
    assert_eq!(env.store.update_calls(), 0);
    assert_eq!(env.store.row(2).unwrap()[0], "OTHER");
    assert_eq!(env.store.row(3).unwrap()[0], "L1");

    let letter = LetterRepo::get_letter(&env.db, "L1").unwrap().unwrap();
    assert_eq!(letter.sheet_row, Some(3));
}

#[tokio::test]
async fn test_padded_imported_id_matches_its_own_row() {
    let env = setup();
    let letter = LetterRepo::create_letter(&env.db, params(" L1 ", "1"), None).unwrap();
    assert_eq!(letter.id, "L1");

    env.reconciler.run_batch(50).await;
    LetterRepo::update_letter(
        &env.db,
        "L1",
        LetterChanges {
            priority: Some(3),
            ..Default::default()
        },
        None,
    )
    .unwrap();
    let result = env.reconciler.run_batch(50).await;
    assert_eq!(result.synced, 1);

    assert_eq!(env.store.append_calls(), 1);
    assert_eq!(env.store.update_calls(), 1);
    assert_eq!(env.store.rows().len(), 2);
    assert_eq!(env.store.row(2).unwrap()[0], "L1");
}

#[tokio::test]
async fn test_empty_cached_row_is_reused() {
    let env = setup();
    LetterRepo::create_letter(&env.db, params("L1", "1"), None).unwrap();
    {
        let conn = env.db.get_conn().unwrap();
        LetterRepo::set_sheet_row(&conn, "L1", 5, &Utc::now()).unwrap();
    }

    env.reconciler.run_batch(50).await;
    assert_eq!(env.store.append_calls(), 0);
    assert_eq!(env.store.row(5).unwrap()[0], "L1");
}

#[tokio::test]
async fn test_per_letter_failure_does_not_abort_batch() {
    let env = setup();
    LetterRepo::create_letter(&env.db, params("L1", "1"), None).unwrap();
    LetterRepo::create_letter(&env.db, params("L2", "2"), None).unwrap();
    {
        let conn = env.db.get_conn().unwrap();
        conn.execute("UPDATE letters SET date = 'garbage' WHERE id = 'L2'", [])
            .unwrap();
    }

    let result = env.reconciler.run_batch(50).await;
    assert_eq!(result.processed, 2);
    assert_eq!(result.synced, 1);
    assert_eq!(result.failed, 1);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("letter L2"));

    let failed = history(&env, "L2");
    assert_eq!(failed[0].sync_status, SyncState::Failed);
    assert_eq!(failed[0].retry_count, 1);
    assert!(failed[0].last_error.is_some());
    assert_eq!(history(&env, "L1")[0].sync_status, SyncState::Synced);
}

#[tokio::test]
async fn test_remote_outage_leaves_records_untouched() {
    let env = setup();
    LetterRepo::create_letter(&env.db, params("L1", "1"), None).unwrap();

    env.store.set_fail_appends(true);
    let result = env.reconciler.run_batch(50).await;
    assert_eq!(result.processed, 1);
    assert_eq!(result.synced, 0);
    assert_eq!(result.failed, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("batch:"));

    let record = &history(&env, "L1")[0];
    assert_eq!(record.sync_status, SyncState::Pending);
    assert_eq!(record.retry_count, 0);

    env.store.set_fail_appends(false);
    env.store.set_fail_reads(true);
    let result = env.reconciler.run_batch(50).await;
    assert!(result.errors[0].starts_with("batch:"));
    assert_eq!(env.store.append_calls(), 1);

    env.store.set_fail_reads(false);
    let result = env.reconciler.run_batch(50).await;
    assert_eq!(result.synced, 1);
    assert!(result.errors.is_empty());
}

#[tokio::test]
async fn test_exhausted_records_are_excluded_until_requeued() {
    let env = setup();
    LetterRepo::create_letter(&env.db, params("L1", "1"), None).unwrap();
    let record_id = history(&env, "L1")[0].id.clone();
    {
        let conn = env.db.get_conn().unwrap();
        for _ in 0..5 {
            ChangeLogRepo::mark_failed(&conn, &[record_id.clone()], "boom").unwrap();
        }
    }

    let result = env.reconciler.run_batch(50).await;
    assert_eq!(result, SyncRunResult::default());
    assert_eq!(env.store.read_calls(), 0);

    let summary = env.reconciler.status().unwrap();
    assert_eq!(summary.exhausted, 1);
    assert_eq!(summary.pending, 0);

    assert_eq!(env.reconciler.requeue_exhausted().unwrap(), 1);
    let result = env.reconciler.run_batch(50).await;
    assert_eq!(result.synced, 1);

    let summary = env.reconciler.status().unwrap();
    assert_eq!(summary.synced, 1);
    assert_eq!(summary.total, 1);
    assert!(summary.last_synced_at.is_some());
}

#[tokio::test]
async fn test_batch_size_bounds_selection() {
    let env = setup();
    for i in 0..5 {
        LetterRepo::create_letter(&env.db, params(&format!("L{i}"), "n"), None).unwrap();
    }

    let first = env.reconciler.run_batch(2).await;
    assert_eq!(first.processed, 2);
    assert_eq!(first.synced, 2);
    // 旧的优先
    assert_eq!(env.store.row(2).unwrap()[0], "L0");
    assert_eq!(env.store.row(3).unwrap()[0], "L1");

    let rest = env.reconciler.run_batch(50).await;
    assert_eq!(rest.processed, 3);
    assert_eq!(env.store.rows().len(), 6);
}

#[tokio::test]
async fn test_missing_configuration_processes_nothing() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Arc::new(LetterDatabase::new(temp_dir.path()).expect("Failed to create database"));
    LetterRepo::create_letter(&db, params("L1", "1"), None).unwrap();

    let reconciler = SheetReconciler::from_config(db.clone(), &AppConfig::default());
    let result = reconciler.run_batch(50).await;
    assert_eq!(result.processed, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("configuration:"));
    assert!(result.errors[0].contains("sheets.spreadsheet_id"));

    let unconfigured = SheetReconciler::new(db.clone(), None, SyncOptions::default());
    let result = unconfigured.run_batch(50).await;
    assert_eq!(result.processed, 0);
    assert!(result.errors[0].starts_with("configuration:"));

    let conn = db.get_conn().unwrap();
    let records = ChangeLogRepo::list_for_letter(&conn, "L1").unwrap();
    assert_eq!(records[0].sync_status, SyncState::Pending);
    assert_eq!(records[0].retry_count, 0);
}

#[tokio::test]
async fn test_check_connection() {
    let env = setup();
    env.reconciler.check_connection().await.expect("memory store reachable");
    assert_eq!(env.store.read_calls(), 1);

    env.store.set_fail_reads(true);
    let err = env.reconciler.check_connection().await.unwrap_err();
    assert!(matches!(err, SyncError::Batch(_)));

    let unconfigured = SheetReconciler::new(env.db.clone(), None, SyncOptions::default());
    let err = unconfigured.check_connection().await.unwrap_err();
    assert!(matches!(err, SyncError::Configuration(_)));
}

/// 读取身份列时挂起一段时间的表格
struct SlowStore {
    inner: MemorySheetStore,
    delay: Duration,
}

#[async_trait]
impl SheetStore for SlowStore {
    fn provider_name(&self) -> &'static str {
        "slow"
    }

    async fn read_column(&self, column: &str, start_row: i64) -> SheetResult<Vec<String>> {
        tokio::time::sleep(self.delay).await;
        self.inner.read_column(column, start_row).await
    }

    async fn batch_update(&self, updates: &[RowUpdate]) -> SheetResult<()> {
        self.inner.batch_update(updates).await
    }

    async fn append_rows(&self, rows: &[Vec<String>]) -> SheetResult<AppendOutcome> {
        self.inner.append_rows(rows).await
    }

    async fn copy_row_format(
        &self,
        source_row: i64,
        start_row: i64,
        count: usize,
    ) -> SheetResult<()> {
        self.inner.copy_row_format(source_row, start_row, count).await
    }
}

#[tokio::test]
async fn test_overlapping_passes_are_skipped() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Arc::new(LetterDatabase::new(temp_dir.path()).expect("Failed to create database"));
    LetterRepo::create_letter(&db, params("L1", "1"), None).unwrap();

    let store: Arc<dyn SheetStore> = Arc::new(SlowStore {
        inner: MemorySheetStore::new(),
        delay: Duration::from_millis(200),
    });
    let reconciler = Arc::new(SheetReconciler::new(
        db,
        Some(store),
        SyncOptions::default(),
    ));
    let scheduler = SyncScheduler::new(reconciler, Duration::from_secs(60), 50);

    let (first, second) = tokio::join!(scheduler.trigger_now(), scheduler.trigger_now());
    let first = first.expect("first pass runs");
    assert_eq!(first.synced, 1);
    assert!(second.is_none(), "overlapping pass must be skipped");

    let third = scheduler.trigger_now().await.expect("guard released");
    assert!(third.is_noop());
}
