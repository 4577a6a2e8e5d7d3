use asupersync::runtime::RuntimeBuilder;

use tessera::prelude::*;
use tessera::{ConstraintKind, MemoryConnection};

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

fn library() -> Arc<DomainModel> {
    DomainModel::builder()
        .entity(
            EntityDecl::new("Author")
                .key("Id", ScalarType::Int)
                .field(FieldDecl::scalar("Name", ScalarType::Text))
                .field(
                    FieldDecl::entity_set("Books", "Book")
                        .paired_with("Author")
                        .on_owner_remove(OnRemoveAction::Cascade),
                ),
        )
        .entity(
            EntityDecl::new("Book")
                .key("Id", ScalarType::Int)
                .field(FieldDecl::scalar("Title", ScalarType::Text))
                .field(FieldDecl::scalar("Version", ScalarType::Int).version())
                .field(FieldDecl::reference("Author", "Author"))
                .field(FieldDecl::entity_set("Tags", "Tag").paired_with("Books")),
        )
        .entity(
            EntityDecl::new("Tag")
                .key("Id", ScalarType::Int)
                .field(FieldDecl::scalar("Label", ScalarType::Text))
                .field(FieldDecl::entity_set("Books", "Book")),
        )
        .entity(
            EntityDecl::new("Customer")
                .key("Id", ScalarType::BigInt)
                .key_generator(KeyGenerator::Sequence("customer_ids".into()))
                .field(FieldDecl::scalar("Name", ScalarType::Text)),
        )
        .build()
        .expect("library model builds")
}

fn open(config: MemoryConfig) -> (Arc<DomainModel>, MemoryDatabase) {
    let model = library();
    let db = MemoryDatabase::from_model(&model, config);
    (model, db)
}

fn session(model: &Arc<DomainModel>, db: &MemoryDatabase) -> Session<MemoryConnection> {
    Session::new(Arc::clone(model), db.connect(), SessionConfig::default())
}

/// One author with `books` books, ids starting at 1.
async fn seed(cx: &Cx, s: &mut Session<MemoryConnection>, books: i32) -> (EntityId, Vec<EntityId>) {
    let author = s.create("Author", vec![Value::Int(1)]).unwrap();
    s.set_value(author, "Name", "Ursula").unwrap();
    let mut ids = Vec::new();
    for n in 1..=books {
        let book = s.create("Book", vec![Value::Int(n)]).unwrap();
        s.set_value(book, "Title", format!("Book {n}")).unwrap();
        unwrap_outcome(s.set_reference(cx, book, "Author", Some(author)).await);
        ids.push(book);
    }
    (author, ids)
}

#[test]
fn batched_flush_is_one_round_trip() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = open(MemoryConfig::default());
        let mut s = session(&model, &db);
        seed(&cx, &mut s, 5).await;

        db.reset_stats();
        let summary = unwrap_outcome(s.flush(&cx).await);
        assert_eq!(summary.inserted, 6);
        assert_eq!(db.stats().round_trips, 1);
        // One multi-row insert per table.
        assert_eq!(db.stats().statements, 2);
        unwrap_outcome(s.commit(&cx).await);
        assert_eq!(db.committed_rows("Book").unwrap().len(), 5);
    });
}

#[test]
fn unbatched_flush_sends_each_statement_separately() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = open(MemoryConfig::default().batching(false));
        let mut s = session(&model, &db);
        seed(&cx, &mut s, 3).await;

        db.reset_stats();
        unwrap_outcome(s.flush(&cx).await);
        let stats = db.stats();
        assert_eq!(stats.round_trips, stats.statements);
        assert!(stats.round_trips >= 2);
    });
}

#[test]
fn redundant_assignments_write_nothing() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = open(MemoryConfig::default());
        let mut s = session(&model, &db);
        let (author, books) = seed(&cx, &mut s, 2).await;
        unwrap_outcome(s.save_changes(&cx).await);

        s.set_value(author, "Name", "Ursula").unwrap();
        s.set_value(books[0], "Title", "Draft").unwrap();
        s.set_value(books[0], "Title", "Book 1").unwrap();
        db.reset_stats();
        let summary = unwrap_outcome(s.save_changes(&cx).await);
        assert!(summary.is_empty());
        assert_eq!(db.stats().statements, 0);

        s.set_value(books[1], "Title", "Second edition").unwrap();
        let summary = unwrap_outcome(s.save_changes(&cx).await);
        assert_eq!(summary.updated, 1);
        assert_eq!(s.peek(books[1], "Version").unwrap(), Some(Value::Int(1)));
        assert_eq!(s.peek(books[0], "Version").unwrap(), Some(Value::Int(0)));
    });
}

#[test]
fn removing_an_author_cascades_to_books_and_their_tag_links() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = open(MemoryConfig::default());
        let mut s = session(&model, &db);
        let (_, books) = seed(&cx, &mut s, 2).await;
        let tag = s.create("Tag", vec![Value::Int(1)]).unwrap();
        s.set_value(tag, "Label", "classic").unwrap();
        unwrap_outcome(s.set_add(&cx, books[0], "Tags", tag).await);
        assert_eq!(unwrap_outcome(s.set_members(&cx, tag, "Books").await), vec![books[0]]);
        unwrap_outcome(s.save_changes(&cx).await);

        let mut s = session(&model, &db);
        let author = unwrap_outcome(s.get(&cx, "Author", vec![Value::Int(1)]).await).unwrap();
        unwrap_outcome(s.remove(&cx, author).await);
        assert_eq!(s.lifecycle(author).unwrap(), EntityLifecycle::Removed);
        let summary = unwrap_outcome(s.save_changes(&cx).await);
        assert_eq!(summary.deleted, 3);

        assert!(db.committed_rows("Author").unwrap().is_empty());
        assert!(db.committed_rows("Book").unwrap().is_empty());
        assert_eq!(db.committed_rows("Tag").unwrap().len(), 1);

        let tag = unwrap_outcome(s.get(&cx, "Tag", vec![Value::Int(1)]).await).unwrap();
        assert!(unwrap_outcome(s.set_members(&cx, tag, "Books").await).is_empty());
    });
}

#[test]
fn removing_a_tagged_book_keeps_the_tag() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = open(MemoryConfig::default());
        let mut s = session(&model, &db);
        let (_, books) = seed(&cx, &mut s, 2).await;
        let tag = s.create("Tag", vec![Value::Int(1)]).unwrap();
        for book in &books {
            unwrap_outcome(s.set_add(&cx, *book, "Tags", tag).await);
        }
        unwrap_outcome(s.save_changes(&cx).await);

        unwrap_outcome(s.remove(&cx, books[0]).await);
        assert_eq!(unwrap_outcome(s.set_members(&cx, tag, "Books").await), vec![books[1]]);
        unwrap_outcome(s.save_changes(&cx).await);

        let mut fresh = session(&model, &db);
        let tag = unwrap_outcome(fresh.get(&cx, "Tag", vec![Value::Int(1)]).await).unwrap();
        let members = unwrap_outcome(fresh.set_members(&cx, tag, "Books").await);
        assert_eq!(members.len(), 1);
        assert_eq!(fresh.key_values(members[0]).unwrap(), vec![Value::Int(2)]);
    });
}

#[test]
fn stale_version_is_rejected() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = open(MemoryConfig::default());
        let mut s = session(&model, &db);
        seed(&cx, &mut s, 1).await;
        unwrap_outcome(s.save_changes(&cx).await);

        let mut alice = session(&model, &db);
        let mut bob = session(&model, &db);
        let a = unwrap_outcome(alice.get(&cx, "Book", vec![Value::Int(1)]).await).unwrap();
        let b = unwrap_outcome(bob.get(&cx, "Book", vec![Value::Int(1)]).await).unwrap();
        alice.set_value(a, "Title", "Alice's").unwrap();
        bob.set_value(b, "Title", "Bob's").unwrap();

        unwrap_outcome(alice.save_changes(&cx).await);
        match expect_err(bob.save_changes(&cx).await) {
            Error::VersionConflict(conflict) => assert_eq!(conflict.entity_type, "Book"),
            other => panic!("expected a version conflict, got {other}"),
        }
        // The failed flush leaves the transaction open and the change pending.
        assert!(bob.in_transaction());
        assert!(bob.has_pending_changes());
        unwrap_outcome(bob.rollback(&cx).await);

        let rows = db.committed_rows("Book").unwrap();
        assert_eq!(rows[0].get_by_name("Title"), Some(&Value::Text("Alice's".into())));
    });
}

#[test]
fn missing_required_reference_is_a_constraint_violation() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = open(MemoryConfig::default());
        let mut s = session(&model, &db);
        let orphan = s.create("Book", vec![Value::Int(9)]).unwrap();
        s.set_value(orphan, "Title", "Orphan").unwrap();

        match expect_err(s.save_changes(&cx).await) {
            Error::ConstraintViolation(v) => {
                assert_eq!(v.kind, ConstraintKind::NotNull);
                assert_eq!(v.table.as_deref(), Some("Book"));
            }
            other => panic!("expected a constraint violation, got {other}"),
        }
        assert!(db.committed_rows("Book").unwrap().is_empty());
        assert_eq!(s.lifecycle(orphan).unwrap(), EntityLifecycle::New);
    });
}

#[test]
fn generated_keys_come_from_the_sequence() {
    let rt = RuntimeBuilder::current_thread().build().expect("runtime");
    let cx = Cx::for_testing();
    rt.block_on(async {
        let (model, db) = open(MemoryConfig::default());
        let mut s = session(&model, &db);
        let first = unwrap_outcome(s.create_with_generated_key(&cx, "Customer").await);
        let second = unwrap_outcome(s.create_with_generated_key(&cx, "Customer").await);
        assert_eq!(s.key_values(first).unwrap(), vec![Value::BigInt(1)]);
        assert_eq!(s.key_values(second).unwrap(), vec![Value::BigInt(2)]);
        unwrap_outcome(s.rollback(&cx).await);

        // Sequences do not roll back.
        let mut other = session(&model, &db);
        let third = unwrap_outcome(other.create_with_generated_key(&cx, "Customer").await);
        assert_eq!(other.key_values(third).unwrap(), vec![Value::BigInt(3)]);

        let err = expect_err(other.create_with_generated_key(&cx, "Tag").await);
        assert!(matches!(err, Error::InvalidOperation(_)), "{err}");
    });
}
