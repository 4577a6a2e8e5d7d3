use super::*;
use asupersync::runtime::RuntimeBuilder;
use tessera_core::{
    EntityDecl, FieldDecl, OnRemoveAction, ScalarType, TransactionErrorKind, Validator,
};
use tessera_memory::{MemoryConfig, MemoryConnection, MemoryDatabase};
use tessera_query::{Args, Query};

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

fn model() -> Arc<DomainModel> {
    DomainModel::builder()
        .entity(
            EntityDecl::new("Owner")
                .key("Id", ScalarType::Int)
                .field(FieldDecl::scalar("Name", ScalarType::Text))
                .field(FieldDecl::scalar("Version", ScalarType::Int).version())
                .field(FieldDecl::entity_set("Pets", "Pet").paired_with("Owner")),
        )
        .entity(
            EntityDecl::new("Pet")
                .key("Id", ScalarType::Int)
                .field(FieldDecl::scalar("Name", ScalarType::Text))
                .field(FieldDecl::reference("Owner", "Owner").nullable())
                .field(FieldDecl::entity_set("Friends", "Pet"))
                .validator(Validator::length("Name", Some(1), None)),
        )
        .entity(
            EntityDecl::new("Node")
                .key("Id", ScalarType::Int)
                .field(
                    FieldDecl::reference("Next", "Node")
                        .nullable()
                        .on_target_remove(OnRemoveAction::Clear),
                ),
        )
        .entity(
            EntityDecl::new("Person")
                .key("Id", ScalarType::Int)
                .field(FieldDecl::reference("Spouse", "Person").nullable())
                .field(FieldDecl::reference("SpouseOf", "Person").nullable().paired_with("Spouse")),
        )
        .build()
        .expect("model builds")
}

fn setup(config: MemoryConfig) -> (Arc<DomainModel>, MemoryDatabase) {
    let model = model();
    let db = MemoryDatabase::from_model(&model, config);
    (model, db)
}

fn session(model: &Arc<DomainModel>, db: &MemoryDatabase) -> Session<MemoryConnection> {
    Session::new(Arc::clone(model), db.connect(), SessionConfig::default())
}

fn pet(s: &mut Session<MemoryConnection>, id: i32, name: &str) -> EntityId {
    let pet = s.create("Pet", vec![Value::Int(id)]).unwrap();
    s.set_value(pet, "Name", name).unwrap();
    pet
}

async fn load(s: &mut Session<MemoryConnection>, cx: &Cx, type_name: &str, id: i32) -> EntityId {
    unwrap_outcome(s.get(cx, type_name, vec![Value::Int(id)]).await).expect("stored entity")
}

#[test]
fn flush_inserts_and_promotes_states() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let owner = s.create("Owner", vec![Value::Int(1)]).unwrap();
        s.set_value(owner, "Name", "Ann").unwrap();
        let rex = pet(&mut s, 10, "Rex");
        unwrap_outcome(s.set_reference(&cx, rex, "Owner", Some(owner)).await);

        let summary = unwrap_outcome(s.flush(&cx).await);
        assert_eq!(summary.inserted, 2);
        assert_eq!(s.lifecycle(owner).unwrap(), EntityLifecycle::Loaded);
        assert!(!s.has_pending_changes());
        assert!(s.in_transaction());

        unwrap_outcome(s.commit(&cx).await);
        assert_eq!(db.committed_rows("Owner").unwrap().len(), 1);
        assert_eq!(db.committed_rows("Pet").unwrap().len(), 1);
    });
}

#[test]
fn unchanged_values_produce_no_update() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let owner = s.create("Owner", vec![Value::Int(1)]).unwrap();
        s.set_value(owner, "Name", "Ann").unwrap();
        unwrap_outcome(s.commit(&cx).await);

        s.set_value(owner, "Name", "Bob").unwrap();
        s.set_value(owner, "Name", "Ann").unwrap();
        let before = db.stats().statements;
        let summary = unwrap_outcome(s.flush(&cx).await);
        assert!(summary.is_empty());
        assert_eq!(db.stats().statements, before);
        assert_eq!(s.lifecycle(owner).unwrap(), EntityLifecycle::Loaded);
    });
}

#[test]
fn identity_map_returns_the_same_id() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut writer = session(&model, &db);
        pet(&mut writer, 1, "Rex");
        unwrap_outcome(writer.save_changes(&cx).await);

        let mut s = session(&model, &db);
        let a = unwrap_outcome(s.get(&cx, "Pet", vec![Value::Int(1)]).await).unwrap();
        let query = Query::all("Pet").filter(|p| p.member("Name").eq("Rex"));
        let b = unwrap_outcome(s.query_entities(&cx, &query, &Args::new()).await);
        assert_eq!(b, vec![a]);
        assert_eq!(s.tracked(), 1);
    });
}

#[test]
fn one_to_many_set_follows_the_reference() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let ann = s.create("Owner", vec![Value::Int(1)]).unwrap();
        let bob = s.create("Owner", vec![Value::Int(2)]).unwrap();
        let rex = pet(&mut s, 10, "Rex");

        unwrap_outcome(s.set_add(&cx, ann, "Pets", rex).await);
        assert_eq!(unwrap_outcome(s.get_reference(&cx, rex, "Owner").await), Some(ann));

        unwrap_outcome(s.set_reference(&cx, rex, "Owner", Some(bob)).await);
        assert!(!unwrap_outcome(s.set_contains(&cx, ann, "Pets", rex).await));
        assert_eq!(unwrap_outcome(s.set_members(&cx, bob, "Pets").await), vec![rex]);
    });
}

#[test]
fn junction_set_changes_are_written_at_flush() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let rex = pet(&mut s, 1, "Rex");
        let tom = pet(&mut s, 2, "Tom");
        unwrap_outcome(s.set_add(&cx, rex, "Friends", tom).await);
        let summary = unwrap_outcome(s.save_changes(&cx).await);
        assert_eq!(summary.links_added, 1);
        assert_eq!(db.committed_rows("Pet_Friends").unwrap().len(), 1);

        unwrap_outcome(s.set_remove(&cx, rex, "Friends", tom).await);
        unwrap_outcome(s.save_changes(&cx).await);
        assert!(db.committed_rows("Pet_Friends").unwrap().is_empty());

        let mut fresh = session(&model, &db);
        let rex = unwrap_outcome(fresh.get(&cx, "Pet", vec![Value::Int(1)]).await).unwrap();
        assert!(unwrap_outcome(fresh.set_members(&cx, rex, "Friends").await).is_empty());
    });
}

#[test]
fn deny_blocks_removal_without_side_effects() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let ann = s.create("Owner", vec![Value::Int(1)]).unwrap();
        s.set_value(ann, "Name", "Ann").unwrap();
        let rex = pet(&mut s, 10, "Rex");
        unwrap_outcome(s.set_reference(&cx, rex, "Owner", Some(ann)).await);

        let err = expect_err(s.remove(&cx, ann).await);
        assert!(matches!(err, Error::ReferentialIntegrity(_)), "{err}");
        assert_eq!(s.lifecycle(ann).unwrap(), EntityLifecycle::New);
        assert_eq!(unwrap_outcome(s.get_reference(&cx, rex, "Owner").await), Some(ann));

        unwrap_outcome(s.save_changes(&cx).await);
        let err = expect_err(s.remove(&cx, ann).await);
        assert!(matches!(err, Error::ReferentialIntegrity(_)), "{err}");

        // With the referencing pet gone first the owner can go too.
        unwrap_outcome(s.remove(&cx, rex).await);
        unwrap_outcome(s.remove(&cx, ann).await);
        let summary = unwrap_outcome(s.save_changes(&cx).await);
        assert_eq!(summary.deleted, 2);
        assert!(db.committed_rows("Owner").unwrap().is_empty());
        assert!(db.committed_rows("Pet").unwrap().is_empty());
    });
}

#[test]
fn set_clear_keeps_the_net_effect_of_each_sequence() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let ann = s.create("Owner", vec![Value::Int(1)]).unwrap();
        s.set_value(ann, "Name", "Ann").unwrap();
        let rex = pet(&mut s, 1, "Rex");
        let tom = pet(&mut s, 2, "Tom");
        pet(&mut s, 3, "Max");
        unwrap_outcome(s.set_reference(&cx, rex, "Owner", Some(ann)).await);
        unwrap_outcome(s.set_add(&cx, rex, "Friends", tom).await);
        unwrap_outcome(s.save_changes(&cx).await);

        let mut s = session(&model, &db);
        let ann = load(&mut s, &cx, "Owner", 1).await;
        let rex = load(&mut s, &cx, "Pet", 1).await;
        let tom = load(&mut s, &cx, "Pet", 2).await;
        let max = load(&mut s, &cx, "Pet", 3).await;

        // {Add, Clear, Add} on a junction set.
        unwrap_outcome(s.set_add(&cx, rex, "Friends", max).await);
        unwrap_outcome(s.set_clear(&cx, rex, "Friends").await);
        unwrap_outcome(s.set_add(&cx, rex, "Friends", max).await);
        assert_eq!(unwrap_outcome(s.set_members(&cx, rex, "Friends").await), vec![max]);

        // {Add, Clear, Add, Clear} on a one-to-many set.
        unwrap_outcome(s.set_add(&cx, ann, "Pets", tom).await);
        unwrap_outcome(s.set_clear(&cx, ann, "Pets").await);
        unwrap_outcome(s.set_add(&cx, ann, "Pets", tom).await);
        unwrap_outcome(s.set_clear(&cx, ann, "Pets").await);
        assert!(unwrap_outcome(s.set_members(&cx, ann, "Pets").await).is_empty());
        unwrap_outcome(s.save_changes(&cx).await);

        let mut fresh = session(&model, &db);
        let rex = load(&mut fresh, &cx, "Pet", 1).await;
        let friends = unwrap_outcome(fresh.set_members(&cx, rex, "Friends").await);
        assert_eq!(friends.len(), 1);
        assert_eq!(fresh.key_values(friends[0]).unwrap(), vec![Value::Int(3)]);
        let ann = load(&mut fresh, &cx, "Owner", 1).await;
        assert!(unwrap_outcome(fresh.set_members(&cx, ann, "Pets").await).is_empty());
        assert_eq!(unwrap_outcome(fresh.get_reference(&cx, rex, "Owner").await), None);
        assert_eq!(db.committed_rows("Pet_Friends").unwrap().len(), 1);
    });
}

#[test]
fn one_to_one_pairs_mirror_each_other() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let a = s.create("Person", vec![Value::Int(1)]).unwrap();
        let b = s.create("Person", vec![Value::Int(2)]).unwrap();

        unwrap_outcome(s.set_reference(&cx, a, "Spouse", Some(b)).await);
        assert_eq!(unwrap_outcome(s.get_reference(&cx, b, "SpouseOf").await), Some(a));

        // A self pair detaches the previous partner.
        unwrap_outcome(s.set_reference(&cx, a, "Spouse", Some(a)).await);
        assert_eq!(unwrap_outcome(s.get_reference(&cx, a, "SpouseOf").await), Some(a));
        assert_eq!(unwrap_outcome(s.get_reference(&cx, b, "SpouseOf").await), None);
        unwrap_outcome(s.save_changes(&cx).await);

        let mut fresh = session(&model, &db);
        let a = unwrap_outcome(fresh.get(&cx, "Person", vec![Value::Int(1)]).await).unwrap();
        let b = unwrap_outcome(fresh.get(&cx, "Person", vec![Value::Int(2)]).await).unwrap();
        assert_eq!(unwrap_outcome(fresh.get_reference(&cx, a, "Spouse").await), Some(a));
        assert_eq!(unwrap_outcome(fresh.get_reference(&cx, a, "SpouseOf").await), Some(a));
        assert_eq!(unwrap_outcome(fresh.get_reference(&cx, b, "SpouseOf").await), None);

        // Writing the inverse side moves the stored reference.
        unwrap_outcome(fresh.set_reference(&cx, b, "SpouseOf", Some(a)).await);
        assert_eq!(unwrap_outcome(fresh.get_reference(&cx, a, "Spouse").await), Some(b));
        assert_eq!(unwrap_outcome(fresh.get_reference(&cx, a, "SpouseOf").await), None);
    });
}

#[test]
fn clear_detaches_referencing_rows() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let a = s.create("Node", vec![Value::Int(1)]).unwrap();
        let b = s.create("Node", vec![Value::Int(2)]).unwrap();
        unwrap_outcome(s.set_reference(&cx, a, "Next", Some(b)).await);
        unwrap_outcome(s.save_changes(&cx).await);

        unwrap_outcome(s.remove(&cx, b).await);
        assert_eq!(unwrap_outcome(s.get_reference(&cx, a, "Next").await), None);
        let summary = unwrap_outcome(s.save_changes(&cx).await);
        assert_eq!((summary.updated, summary.deleted), (1, 1));
        assert_eq!(db.committed_rows("Node").unwrap().len(), 1);
    });
}

#[test]
fn reference_cycles_are_inserted_with_a_deferred_update() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let a = s.create("Node", vec![Value::Int(1)]).unwrap();
        let b = s.create("Node", vec![Value::Int(2)]).unwrap();
        unwrap_outcome(s.set_reference(&cx, a, "Next", Some(b)).await);
        unwrap_outcome(s.set_reference(&cx, b, "Next", Some(a)).await);
        let summary = unwrap_outcome(s.save_changes(&cx).await);
        assert_eq!(summary.inserted, 2);

        let rows = db.committed_rows("Node").unwrap();
        assert!(rows.iter().all(|r| !r.get_by_name("Next.Id").unwrap().is_null()));
    });
}

#[test]
fn concurrent_modification_is_a_version_conflict() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut setup_session = session(&model, &db);
        setup_session.create("Owner", vec![Value::Int(1)]).unwrap();
        unwrap_outcome(setup_session.save_changes(&cx).await);

        let mut first = session(&model, &db);
        let mut second = session(&model, &db);
        let a = unwrap_outcome(first.get(&cx, "Owner", vec![Value::Int(1)]).await).unwrap();
        let b = unwrap_outcome(second.get(&cx, "Owner", vec![Value::Int(1)]).await).unwrap();
        first.set_value(a, "Name", "first").unwrap();
        second.set_value(b, "Name", "second").unwrap();

        unwrap_outcome(first.save_changes(&cx).await);
        assert_eq!(first.peek(a, "Version").unwrap(), Some(Value::Int(1)));
        let err = expect_err(second.save_changes(&cx).await);
        assert!(matches!(err, Error::VersionConflict(_)), "{err}");
    });
}

#[test]
fn expected_versions_override_the_loaded_image() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let owner = s.create("Owner", vec![Value::Int(1)]).unwrap();
        unwrap_outcome(s.save_changes(&cx).await);
        let mut stale = VersionSet::new();
        stale.add(s.version_info(owner).unwrap());

        s.set_value(owner, "Name", "changed").unwrap();
        unwrap_outcome(s.save_changes(&cx).await);

        let mut client = session(&model, &db);
        let owner = unwrap_outcome(client.get(&cx, "Owner", vec![Value::Int(1)]).await).unwrap();
        client.expect_versions(&stale).unwrap();
        client.set_value(owner, "Name", "late").unwrap();
        let err = expect_err(client.save_changes(&cx).await);
        assert!(matches!(err, Error::VersionConflict(_)), "{err}");
    });
}

#[test]
fn validation_failure_writes_nothing() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let unnamed = s.create("Pet", vec![Value::Int(1)]).unwrap();
        let err = expect_err(s.flush(&cx).await);
        assert!(matches!(err, Error::Validation(_)), "{err}");
        assert_eq!(db.stats().statements, 0);

        s.set_value(unnamed, "Name", "Rex").unwrap();
        unwrap_outcome(s.save_changes(&cx).await);
        assert_eq!(db.committed_rows("Pet").unwrap().len(), 1);
    });
}

#[test]
fn flush_without_transaction_needs_auto_begin() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let config = SessionConfig::default().auto_begin(false);
        let mut s = Session::new(Arc::clone(&model), db.connect(), config);
        pet(&mut s, 1, "Rex");
        let err = expect_err(s.flush(&cx).await);
        assert!(matches!(
            err,
            Error::Transaction(tessera_core::TransactionError {
                kind: TransactionErrorKind::NotActive,
                ..
            })
        ));
        unwrap_outcome(s.begin(&cx).await);
        unwrap_outcome(s.commit(&cx).await);
        assert_eq!(db.committed_rows("Pet").unwrap().len(), 1);
    });
}

#[test]
fn savepoint_scope_rollback_restores_states() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let outer = unwrap_outcome(s.transaction(&cx, TransactionMode::Auto).await);
        let rex = pet(&mut s, 1, "Rex");
        unwrap_outcome(s.flush(&cx).await);

        let inner = unwrap_outcome(s.transaction(&cx, TransactionMode::New).await);
        s.set_value(rex, "Name", "Renamed").unwrap();
        let tom = pet(&mut s, 2, "Tom");
        unwrap_outcome(s.flush(&cx).await);
        unwrap_outcome(s.rollback_scope(&cx, inner).await);

        assert!(s.lifecycle(tom).is_err());
        assert_eq!(s.peek(rex, "Name").unwrap(), Some(Value::Text("Rex".into())));
        assert_eq!(s.lifecycle(rex).unwrap(), EntityLifecycle::Loaded);

        unwrap_outcome(s.complete(&cx, outer).await);
        assert!(!s.in_transaction());
        let rows = db.committed_rows("Pet").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("Name"), Some(&Value::Text("Rex".into())));
    });
}

#[test]
fn dropped_scope_is_rolled_back_at_the_next_operation() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        {
            let _scope = unwrap_outcome(s.transaction(&cx, TransactionMode::Auto).await);
            pet(&mut s, 1, "Rex");
            unwrap_outcome(s.flush(&cx).await);
        }
        assert_eq!(s.scope_depth(), 1);
        let found = unwrap_outcome(s.get(&cx, "Pet", vec![Value::Int(1)]).await);
        assert_eq!(found, None);
        assert_eq!(s.scope_depth(), 0);
        assert!(!s.in_transaction());
        assert!(db.committed_rows("Pet").unwrap().is_empty());
    });
}

#[test]
fn completing_an_outer_scope_first_is_a_mismatch() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let outer = unwrap_outcome(s.transaction(&cx, TransactionMode::Auto).await);
        let inner = unwrap_outcome(s.transaction(&cx, TransactionMode::New).await);
        let err = expect_err(s.complete(&cx, outer).await);
        assert!(matches!(
            err,
            Error::Transaction(tessera_core::TransactionError {
                kind: TransactionErrorKind::ScopeMismatch,
                ..
            })
        ));
        // The rejected outer token is abandoned, taking the inner scope with it.
        let err = expect_err(s.complete(&cx, inner).await);
        assert!(matches!(err, Error::Transaction(_)), "{err}");
        assert_eq!(s.scope_depth(), 0);
        assert!(!s.in_transaction());
    });
}

#[test]
fn futures_share_one_round_trip() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        pet(&mut s, 1, "Rex");
        pet(&mut s, 2, "Tom");
        unwrap_outcome(s.save_changes(&cx).await);

        let pets = s.future(&Query::all("Pet"), &Args::new()).unwrap();
        let count = s.future(&Query::all("Owner").count(), &Args::new()).unwrap();
        assert_eq!(s.pending_futures(), 2);

        db.reset_stats();
        let pets = unwrap_outcome(s.resolve(&cx, pets).await);
        let count = unwrap_outcome(s.resolve(&cx, count).await);
        assert_eq!(db.stats().round_trips, 1);
        assert_eq!(pets.len(), 2);
        assert_eq!(count[0].as_scalar(), Some(&Value::BigInt(0)));
    });
}

#[test]
fn removed_then_recreated_key_becomes_an_update() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = setup(MemoryConfig::default());
        let mut s = session(&model, &db);
        let old = pet(&mut s, 1, "Rex");
        unwrap_outcome(s.save_changes(&cx).await);

        unwrap_outcome(s.remove(&cx, old).await);
        let new = pet(&mut s, 1, "Max");
        assert_ne!(old, new);
        let summary = unwrap_outcome(s.save_changes(&cx).await);
        assert_eq!((summary.inserted, summary.updated, summary.deleted), (0, 1, 0));
        let rows = db.committed_rows("Pet").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("Name"), Some(&Value::Text("Max".into())));
    });
}
