use std::sync::Arc;

use tessera_core::{
    BinaryOp, DomainModel, EntityDecl, Error, FieldDecl, InheritanceMapping, InterfaceDecl,
    JoinKind, QueryPlan, ScalarExpr, ScalarType, SelectPlan, SetOpKind, Source, StructureDecl,
    StructureValue,
};

use crate::compiled::compile;
use crate::expr::Expr;
use crate::query::{ElementType, Query};
use crate::shape::ResultShape;

pub(crate) fn library() -> Arc<DomainModel> {
    DomainModel::builder()
        .structure(
            StructureDecl::new("Point")
                .field(FieldDecl::scalar("X", ScalarType::Int))
                .field(FieldDecl::scalar("Y", ScalarType::Int)),
        )
        .interface(InterfaceDecl::new("INamed").field(FieldDecl::scalar("Name", ScalarType::Text)))
        .entity(
            EntityDecl::new("Person")
                .key("Id", ScalarType::Int)
                .abstract_type()
                .implements("INamed")
                .field(FieldDecl::scalar("Name", ScalarType::Text))
                .field(FieldDecl::scalar("Bio", ScalarType::Text).nullable().lazy()),
        )
        .entity(
            EntityDecl::new("Writer")
                .extends("Person")
                .field(FieldDecl::entity_set("Books", "Book").paired_with("Author")),
        )
        .entity(EntityDecl::new("Editor").extends("Person"))
        .entity(
            EntityDecl::new("Book")
                .key("Isbn", ScalarType::Text)
                .field(FieldDecl::scalar("Title", ScalarType::Text))
                .field(FieldDecl::scalar("Pages", ScalarType::Int))
                .field(FieldDecl::scalar("Year", ScalarType::Int).nullable())
                .field(FieldDecl::structure("Size", "Point"))
                .field(FieldDecl::reference("Author", "Writer").nullable())
                .field(FieldDecl::entity_set("Tags", "Tag")),
        )
        .entity(
            EntityDecl::new("Tag")
                .key("Id", ScalarType::Int)
                .mapping(InheritanceMapping::ConcreteTable)
                .implements("INamed")
                .field(FieldDecl::scalar("Name", ScalarType::Text)),
        )
        .build()
        .expect("model builds")
}

fn plan(query: &Query) -> QueryPlan {
    compile(&library(), query).unwrap().plan().clone()
}

fn select(plan: &QueryPlan) -> &SelectPlan {
    match plan {
        QueryPlan::Select(select) => select,
        other => panic!("expected a select, got {other:?}"),
    }
}

fn text(plan: &QueryPlan) -> String {
    format!("{plan:?}")
}

#[test]
fn all_reads_the_table_directly() {
    let compiled = compile(&library(), &Query::all("Book")).unwrap();
    let s = select(compiled.plan());
    assert!(matches!(&s.from, Source::Table { name, .. } if name == "Book"));
    assert!(s.joins.is_empty());
    assert!(s.filter.is_none());
    let ResultShape::Entity { columns, key, .. } = compiled.shape() else {
        panic!("expected an entity shape");
    };
    assert_eq!(key, &vec![0]);
    assert!(columns.iter().all(Option::is_some));
}

#[test]
fn subtype_source_filters_the_discriminator() {
    let p = plan(&Query::all("Editor"));
    let s = select(&p);
    assert!(matches!(&s.from, Source::Table { name, .. } if name == "Person"));
    assert!(matches!(s.filter, Some(ScalarExpr::InList { .. })));
}

#[test]
fn lazy_columns_are_not_materialized() {
    let compiled = compile(&library(), &Query::all("Writer")).unwrap();
    let ResultShape::Entity { columns, .. } = compiled.shape() else {
        panic!("expected an entity shape");
    };
    // Id, Name, Bio
    assert_eq!(columns.len(), 3);
    assert!(columns[2].is_none());
}

#[test]
fn nullable_comparisons_are_null_safe() {
    let nullable = plan(&Query::all("Book").filter(|b| b.member("Year").eq(Expr::param("y"))));
    assert!(text(&nullable).contains("NullSafeEq"));

    let plain = plan(&Query::all("Book").filter(|b| b.member("Pages").eq(3)));
    assert!(!text(&plain).contains("NullSafeEq"));

    let null = plan(&Query::all("Book").filter(|b| b.member("Year").eq(Expr::null())));
    assert!(matches!(select(&null).filter, Some(ScalarExpr::IsNull(_))));
}

#[test]
fn navigation_joins_are_shared_per_path() {
    let p = plan(&Query::all("Book").filter(|b| {
        b.path("Author.Name")
            .eq("Ann")
            .or(b.path("Author.Name").eq("Bob"))
    }));
    let s = select(&p);
    assert_eq!(s.joins.len(), 1);
    assert_eq!(s.joins[0].kind, JoinKind::Left);
}

#[test]
fn reading_a_referenced_key_needs_no_join() {
    let p = plan(&Query::all("Book").filter(|b| b.path("Author.Id").eq(4)));
    assert!(select(&p).joins.is_empty());
}

#[test]
fn entity_constants_compare_by_key() {
    let p = plan(&Query::all("Book").filter(|b| b.member("Author").eq(Expr::entity("Writer", [4]))));
    let s = select(&p);
    assert!(s.joins.is_empty());
    assert!(text(&p).contains("NullSafeEq"));
}

#[test]
fn interface_sources_union_every_table() {
    let compiled = compile(&library(), &Query::all("INamed")).unwrap();
    let s = select(compiled.plan());
    let Source::Subquery { plan, .. } = &s.from else {
        panic!("expected a derived table");
    };
    assert!(matches!(
        plan.as_ref(),
        QueryPlan::SetOp {
            op: SetOpKind::UnionAll,
            ..
        }
    ));
}

#[test]
fn of_type_narrows_within_a_single_table() {
    let p = plan(&Query::all("Person").of_type("Writer").filter(|w| w.member("Name").eq("Ann")));
    let s = select(&p);
    assert!(s.joins.is_empty());
    assert!(text(&p).contains("InList"));
}

#[test]
fn structure_equality_compares_leaves() {
    let size = StructureValue::new("Point").with("X", 1).with("Y", 2);
    let p = plan(&Query::all("Book").filter(move |b| b.member("Size").eq(Expr::structure(size))));
    let Some(ScalarExpr::Binary { op, .. }) = &select(&p).filter else {
        panic!("expected a conjunction");
    };
    assert_eq!(*op, BinaryOp::And);
}

#[test]
fn structure_literal_of_another_type_is_a_mismatch() {
    let model = DomainModel::builder()
        .structure(StructureDecl::new("Point").field(FieldDecl::scalar("X", ScalarType::Int)))
        .structure(StructureDecl::new("Point3").extends("Point"))
        .entity(
            EntityDecl::new("Shape")
                .key("Id", ScalarType::Int)
                .field(FieldDecl::structure("At", "Point")),
        )
        .build()
        .unwrap();
    let other = StructureValue::new("Point3").with("X", 1);
    let q = Query::all("Shape").filter(move |s| s.member("At").eq(Expr::structure(other)));
    let err = compile(&model, &q).unwrap_err();
    assert!(matches!(err, Error::TypeMismatch(_)));
}

#[test]
fn statically_empty_queries_compile_to_empty_plans() {
    let q = Query::empty(ElementType::Entity("Book".into())).filter(|b| b.member("Pages").gt(1));
    let compiled = compile(&library(), &q).unwrap();
    assert!(compiled.is_empty());
    assert!(!compile(&library(), &Query::all("Book").take(0)).unwrap().plan().output_columns().is_empty());
}

#[test]
fn untranslatable_calls_fail_at_compile_time() {
    let q = Query::all("Book").filter(|b| Expr::call("IsPrime", vec![b.member("Pages")]));
    let err = compile(&library(), &q).unwrap_err();
    assert!(matches!(err, Error::QueryTranslation(_)));

    let err = compile(&library(), &Query::all("Nope")).unwrap_err();
    assert!(matches!(err, Error::QueryTranslation(_)));
}

#[test]
fn filter_after_take_wraps_the_select() {
    let p = plan(&Query::all("Book").order_by(|b| b.member("Pages")).take(3).filter(|b| b.member("Pages").gt(10)));
    let s = select(&p);
    let Source::Subquery { plan: inner, .. } = &s.from else {
        panic!("expected a derived table");
    };
    assert_eq!(select(inner).limit, Some(3));
    assert!(s.filter.is_some());
    // the ordering the limit relies on is carried outward
    assert_eq!(s.order_by.len(), 1);
}

#[test]
fn group_sum_is_coalesced() {
    let q = Query::all("Book")
        .group_by(|b| b.member("Year"))
        .select(|g| Expr::record([("Year", g.key()), ("Pages", g.group_sum(|b| b.member("Pages")))]));
    let p = plan(&q);
    let s = select(&p);
    assert_eq!(s.group_by.len(), 1);
    assert!(matches!(s.projection[1].expr, ScalarExpr::Coalesce(_)));
}

#[test]
fn boolean_group_keys_become_case() {
    let q = Query::all("Book")
        .group_by(|b| b.member("Pages").gt(100))
        .select(|g| g.group_count());
    let p = plan(&q);
    let s = select(&p);
    let Source::Subquery { plan: inner, .. } = &s.from else {
        panic!("expected a derived table");
    };
    assert!(select(inner).projection.iter().any(|p| matches!(p.expr, ScalarExpr::Case { .. })));
}

#[test]
fn groups_must_be_projected() {
    let q = Query::all("Book").group_by(|b| b.member("Year"));
    assert!(matches!(compile(&library(), &q), Err(Error::QueryTranslation(_))));
}

#[test]
fn set_operands_must_have_the_same_shape() {
    let titles = Query::all("Book").select(|b| b.member("Title"));
    let books = Query::all("Book");
    let err = compile(&library(), &titles.union(&books)).unwrap_err();
    assert!(matches!(err, Error::QueryTranslation(_)));
    let p = plan(&titles.concat(&titles));
    assert!(text(&p).contains("UnionAll"));
}

#[test]
fn entity_set_any_becomes_exists() {
    let q = Query::all("Writer").filter(|w| {
        Expr::any(Query::navigate(w.member("Books")), |b| b.member("Pages").gt(100))
    });
    let p = plan(&q);
    let filter = select(&p).filter.as_ref().expect("a filter");
    assert!(conjuncts(filter).iter().any(|c| matches!(c, ScalarExpr::Exists(_))), "{filter:?}");
}

/// The operands of a chain of ANDs.
fn conjuncts(expr: &ScalarExpr) -> Vec<&ScalarExpr> {
    match expr {
        ScalarExpr::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            let mut all = conjuncts(left);
            all.extend(conjuncts(right));
            all
        }
        other => vec![other],
    }
}

#[test]
fn many_to_many_sets_read_through_the_junction() {
    let q = Query::all("Book").select(|b| Expr::count(Query::navigate(b.member("Tags"))));
    let p = plan(&q);
    assert!(text(&p).contains("Book_Tags"));
}

#[test]
fn subqueries_over_empty_sources_fold() {
    let q = Query::all("Book").filter(|_| {
        Expr::any(Query::empty(ElementType::Entity("Tag".into())), |t| t.member("Id").gt(0))
    });
    let p = plan(&q);
    assert_eq!(select(&p).filter, Some(ScalarExpr::literal(false)));
}

#[test]
fn outer_variables_reach_nested_subqueries() {
    let q = Query::all("Writer").filter(|w| {
        Expr::any(Query::all("Book"), |b| {
            Expr::any(Query::all("Tag"), |t| t.member("Name").eq(w.member("Name")).and(b.member("Pages").gt(1)))
        })
    });
    assert!(compile(&library(), &q).is_ok());
}

#[test]
fn local_sequences_bind_through_values() {
    let q = Query::local_values(ScalarType::Int, [1, 2, 3]).select(|v| v.add(1));
    let p = plan(&q);
    assert!(matches!(select(&p).from, Source::Values { .. }));
}
