use asupersync::runtime::RuntimeBuilder;

use tessera::prelude::*;
use tessera::{MemoryConnection, SessionProfile, TransactionErrorKind};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn ledger() -> Arc<DomainModel> {
    DomainModel::builder()
        .entity(
            EntityDecl::new("Account")
                .key("Id", ScalarType::Int)
                .field(FieldDecl::scalar("Owner", ScalarType::Text))
                .field(FieldDecl::scalar("Balance", ScalarType::BigInt)),
        )
        .build()
        .expect("ledger model builds")
}

fn open(config: MemoryConfig, session_config: SessionConfig) -> (MemoryDatabase, Session<MemoryConnection>) {
    let model = ledger();
    let db = MemoryDatabase::from_model(&model, config);
    let session = Session::new(model, db.connect(), session_config);
    (db, session)
}

fn account(s: &mut Session<MemoryConnection>, id: i32, balance: i64) -> EntityId {
    let account = s.create("Account", vec![Value::Int(id)]).unwrap();
    s.set_value(account, "Owner", format!("owner {id}")).unwrap();
    s.set_value(account, "Balance", balance).unwrap();
    account
}

fn is_transaction_error(err: &Error, kind: TransactionErrorKind) -> bool {
    matches!(err, Error::Transaction(t) if t.kind == kind)
}

#[test]
fn savepoint_scope_rollback_keeps_outer_work() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (db, mut s) = open(MemoryConfig::default(), SessionConfig::default());
        let outer = unwrap_outcome(s.transaction(&cx, TransactionMode::Auto).await);
        let first = account(&mut s, 1, 100);
        unwrap_outcome(s.flush(&cx).await);

        let inner = unwrap_outcome(s.transaction(&cx, TransactionMode::New).await);
        assert_eq!(s.scope_depth(), 2);
        s.set_value(first, "Balance", 0_i64).unwrap();
        let second = account(&mut s, 2, 50);
        unwrap_outcome(s.flush(&cx).await);
        unwrap_outcome(s.rollback_scope(&cx, inner).await);

        assert_eq!(s.scope_depth(), 1);
        assert!(s.lifecycle(second).is_err());
        assert_eq!(s.peek(first, "Balance").unwrap(), Some(Value::BigInt(100)));

        unwrap_outcome(s.complete(&cx, outer).await);
        let rows = db.committed_rows("Account").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("Balance"), Some(&Value::BigInt(100)));
    });
}

#[test]
fn completed_inner_scope_commits_with_the_outer_one() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (db, mut s) = open(MemoryConfig::default(), SessionConfig::default());
        let outer = unwrap_outcome(s.transaction(&cx, TransactionMode::Auto).await);
        let inner = unwrap_outcome(s.transaction(&cx, TransactionMode::New).await);
        account(&mut s, 1, 10);
        unwrap_outcome(s.complete(&cx, inner).await);
        assert!(db.committed_rows("Account").unwrap().is_empty());

        unwrap_outcome(s.complete(&cx, outer).await);
        assert_eq!(db.committed_rows("Account").unwrap().len(), 1);
        assert_eq!(db.stats().commits, 1);
    });
}

#[test]
fn rolling_back_a_joined_scope_rolls_back_the_transaction() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (db, mut s) = open(MemoryConfig::default(), SessionConfig::default());
        let outer = unwrap_outcome(s.transaction(&cx, TransactionMode::Auto).await);
        let first = account(&mut s, 1, 10);
        unwrap_outcome(s.flush(&cx).await);

        let joined = unwrap_outcome(s.transaction(&cx, TransactionMode::Auto).await);
        account(&mut s, 2, 20);
        unwrap_outcome(s.rollback_scope(&cx, joined).await);

        assert!(!s.in_transaction());
        assert_eq!(s.scope_depth(), 0);
        assert!(s.lifecycle(first).is_err());
        let err = expect_err(s.complete(&cx, outer).await);
        assert!(is_transaction_error(&err, TransactionErrorKind::ScopeMismatch), "{err}");
        assert!(db.committed_rows("Account").unwrap().is_empty());
    });
}

#[test]
fn new_scope_needs_savepoints() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (_db, mut s) = open(MemoryConfig::default().savepoints(false), SessionConfig::default());
        let outer = unwrap_outcome(s.transaction(&cx, TransactionMode::Auto).await);
        let err = expect_err(s.transaction(&cx, TransactionMode::New).await);
        assert!(matches!(err, Error::InvalidOperation(_)), "{err}");

        account(&mut s, 1, 10);
        unwrap_outcome(s.complete(&cx, outer).await);
    });
}

#[test]
fn rollback_restores_everything_since_the_last_commit() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (db, mut s) = open(MemoryConfig::default(), SessionConfig::default());
        let first = account(&mut s, 1, 10);
        unwrap_outcome(s.save_changes(&cx).await);

        s.set_value(first, "Balance", 99_i64).unwrap();
        let second = account(&mut s, 2, 20);
        unwrap_outcome(s.flush(&cx).await);
        unwrap_outcome(s.remove(&cx, first).await);
        unwrap_outcome(s.rollback(&cx).await);

        assert_eq!(s.lifecycle(first).unwrap(), EntityLifecycle::Loaded);
        assert_eq!(s.peek(first, "Balance").unwrap(), Some(Value::BigInt(10)));
        assert!(s.lifecycle(second).is_err());
        assert!(!s.has_pending_changes());
        assert_eq!(db.stats().rollbacks, 1);
        assert_eq!(db.committed_rows("Account").unwrap().len(), 1);
    });
}

#[test]
fn commit_requires_a_transaction_when_auto_begin_is_off() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let config = SessionConfig::default().auto_begin(false);
        let (db, mut s) = open(MemoryConfig::default(), config);
        account(&mut s, 1, 10);
        let err = expect_err(s.commit(&cx).await);
        assert!(is_transaction_error(&err, TransactionErrorKind::NotActive), "{err}");

        unwrap_outcome(s.begin(&cx).await);
        unwrap_outcome(s.begin(&cx).await);
        unwrap_outcome(s.commit(&cx).await);
        assert_eq!(db.committed_rows("Account").unwrap().len(), 1);
    });
}

#[test]
fn client_profile_defers_persistence_until_save() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (db, mut s) = open(MemoryConfig::default(), SessionConfig::client());
        account(&mut s, 1, 10);

        let stored = unwrap_outcome(s.query_entities(&cx, &Query::all("Account"), &Args::new()).await);
        assert!(stored.is_empty());
        assert_eq!(db.stats().statements, 0);
        assert!(s.has_pending_changes());

        let summary = unwrap_outcome(s.save_changes(&cx).await);
        assert_eq!(summary.inserted, 1);
        let stored = unwrap_outcome(s.query_entities(&cx, &Query::all("Account"), &Args::new()).await);
        assert_eq!(stored.len(), 1);
    });
}

#[test]
fn configuration_loads_from_json() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let json = serde_json::json!({ "profile": "Client", "auto_flush": false, "batch_size": 2 });
        let config = SessionConfig::from_json(&json.to_string()).unwrap();
        assert_eq!(config.profile, SessionProfile::Client);
        assert!(config.auto_begin);

        let (_db, mut s) = open(MemoryConfig::default(), config);
        for id in 1..=5 {
            account(&mut s, id, 1);
        }
        let summary = unwrap_outcome(s.save_changes(&cx).await);
        assert_eq!(summary.inserted, 5);
        assert_eq!(summary.statements, 3);

        let err = SessionConfig::from_json(r#"{ "batch_size": 0 }"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    });
}
