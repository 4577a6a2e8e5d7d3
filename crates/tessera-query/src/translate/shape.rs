//! Shapes of translated values.
//!
//! A shape describes how a value of the query language is represented by
//! scalar expressions over the sources in scope.

use std::collections::HashMap;
use std::rc::Rc;

use tessera_core::{AssocIdx, ScalarExpr, ScalarType, StructIdx, TypeIdx, TypeRef};

use crate::shape::ResultShape;

#[derive(Debug, Clone)]
pub(super) struct ScalarShape {
    pub expr: ScalarExpr,
    pub ty: Option<ScalarType>,
    pub nullable: bool,
}

impl ScalarShape {
    pub fn new(expr: ScalarExpr, ty: Option<ScalarType>, nullable: bool) -> Self {
        Self { expr, ty, nullable }
    }
}

#[derive(Debug, Clone)]
pub(super) struct StructShape {
    pub ty: StructIdx,
    pub leaves: Vec<ScalarShape>,
}

/// Columns of an entity that are reachable in the current select.
#[derive(Debug)]
pub(super) struct Resolved {
    pub type_id: ScalarExpr,
    pub columns: HashMap<String, ScalarExpr>,
    /// Alias and table of a single-table hierarchy read directly; every column
    /// of the table is reachable through it.
    pub direct: Option<(String, String)>,
}

/// A reference navigation whose join has not been emitted yet.
#[derive(Debug)]
pub(super) struct PendingNav {
    /// Frame that receives the join
    pub frame: u32,
    /// Deduplication key of the navigation path
    pub path: String,
    pub target: TypeIdx,
    /// Foreign key expressions; they equal the target's key
    pub fk: Vec<ScalarExpr>,
    pub optional: bool,
}

#[derive(Debug, Clone)]
pub(super) enum Body {
    Resolved(Rc<Resolved>),
    Pending(Rc<PendingNav>),
    /// Only the key is known (entity constants).
    KeyOnly,
}

#[derive(Debug, Clone)]
pub(super) struct EntityShape {
    pub ty: TypeRef,
    /// Frame whose select holds the entity's columns
    pub home: Option<u32>,
    pub key: Vec<ScalarExpr>,
    pub body: Body,
    /// Reached through an outer join; may be absent
    pub optional: bool,
}

#[derive(Debug, Clone)]
pub(super) struct GroupShape {
    pub key: Box<Shape>,
    pub element: Box<Shape>,
}

#[derive(Debug, Clone)]
pub(super) struct SetShape {
    pub owner: EntityShape,
    pub assoc: AssocIdx,
}

#[derive(Debug, Clone)]
pub(super) enum Shape {
    Scalar(ScalarShape),
    Entity(EntityShape),
    Structure(StructShape),
    Record(Vec<(String, Shape)>),
    Group(GroupShape),
    /// Entity-set navigation; only usable as a subquery source
    Set(SetShape),
}

impl Shape {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Shape::Scalar(_) => "scalar",
            Shape::Entity(_) => "entity",
            Shape::Structure(_) => "structure",
            Shape::Record(_) => "record",
            Shape::Group(_) => "group",
            Shape::Set(_) => "entity set",
        }
    }

    /// The same shape read through an outer join.
    pub fn into_optional(self) -> Shape {
        match self {
            Shape::Scalar(s) => Shape::Scalar(ScalarShape {
                nullable: true,
                ..s
            }),
            Shape::Entity(e) => Shape::Entity(EntityShape {
                optional: true,
                ..e
            }),
            Shape::Structure(s) => Shape::Structure(StructShape {
                ty: s.ty,
                leaves: s
                    .leaves
                    .into_iter()
                    .map(|l| ScalarShape {
                        nullable: true,
                        ..l
                    })
                    .collect(),
            }),
            Shape::Record(fields) => Shape::Record(
                fields
                    .into_iter()
                    .map(|(n, s)| (n, s.into_optional()))
                    .collect(),
            ),
            other => other,
        }
    }
}

/// Position of a shape's values within a projection.
#[derive(Debug, Clone)]
pub(super) enum Layout {
    Scalar {
        column: usize,
        ty: Option<ScalarType>,
        nullable: bool,
    },
    Entity {
        ty: TypeRef,
        key_width: usize,
        columns: Vec<(String, Option<usize>)>,
        type_id: usize,
        optional: bool,
    },
    Structure {
        ty: StructIdx,
        leaves: Vec<(usize, Option<ScalarType>, bool)>,
    },
    Record(Vec<(String, Layout)>),
}

pub(super) fn column_name(index: usize) -> String {
    format!("c{index}")
}

impl Layout {
    /// The shape read back from a derived table aliased `alias`.
    pub fn rebase(&self, alias: &str, home: u32) -> Shape {
        let col = |i: usize| ScalarExpr::column(alias, column_name(i));
        match self {
            Layout::Scalar {
                column,
                ty,
                nullable,
            } => Shape::Scalar(ScalarShape::new(col(*column), *ty, *nullable)),
            Layout::Entity {
                ty,
                key_width,
                columns,
                type_id,
                optional,
            } => {
                let resolved: HashMap<String, ScalarExpr> = columns
                    .iter()
                    .filter_map(|(name, i)| i.map(|i| (name.clone(), col(i))))
                    .collect();
                let key = columns
                    .iter()
                    .take(*key_width)
                    .filter_map(|(_, i)| i.map(col))
                    .collect();
                Shape::Entity(EntityShape {
                    ty: *ty,
                    home: Some(home),
                    key,
                    body: Body::Resolved(Rc::new(Resolved {
                        type_id: col(*type_id),
                        columns: resolved,
                        direct: None,
                    })),
                    optional: *optional,
                })
            }
            Layout::Structure { ty, leaves } => Shape::Structure(StructShape {
                ty: *ty,
                leaves: leaves
                    .iter()
                    .map(|(i, t, n)| ScalarShape::new(col(*i), *t, *n))
                    .collect(),
            }),
            Layout::Record(fields) => Shape::Record(
                fields
                    .iter()
                    .map(|(n, l)| (n.clone(), l.rebase(alias, home)))
                    .collect(),
            ),
        }
    }

    pub fn result_shape(&self) -> ResultShape {
        match self {
            Layout::Scalar { column, .. } => ResultShape::Scalar { column: *column },
            Layout::Entity {
                ty,
                key_width,
                columns,
                type_id,
                ..
            } => ResultShape::Entity {
                ty: *ty,
                type_id: *type_id,
                key: columns
                    .iter()
                    .take(*key_width)
                    .filter_map(|(_, i)| *i)
                    .collect(),
                columns: columns.iter().map(|(_, i)| *i).collect(),
            },
            Layout::Structure { ty, leaves } => ResultShape::Structure {
                ty: *ty,
                columns: leaves.iter().map(|(i, _, _)| *i).collect(),
            },
            Layout::Record(fields) => ResultShape::Record(
                fields
                    .iter()
                    .map(|(n, l)| (n.clone(), l.result_shape()))
                    .collect(),
            ),
        }
    }

    /// Compatibility signature of set-operation operands.
    pub fn signature(&self) -> String {
        match self {
            Layout::Scalar { .. } => "s".to_string(),
            Layout::Entity { ty, columns, .. } => format!("e{ty}/{}", columns.len()),
            Layout::Structure { ty, leaves } => format!("t{}/{}", ty.0, leaves.len()),
            Layout::Record(fields) => {
                let inner: Vec<String> = fields
                    .iter()
                    .map(|(n, l)| format!("{n}:{}", l.signature()))
                    .collect();
                format!("{{{}}}", inner.join(","))
            }
        }
    }
}
