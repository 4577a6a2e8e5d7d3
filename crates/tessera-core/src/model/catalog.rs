//! Relational catalog derived from the domain model.
//!
//! Drivers create storage from these schemas; the flush scheduler and the
//! translator only read column facts (nullability, keys, foreign keys).

use std::collections::HashMap;

use super::{
    DomainModel, FieldKind, InheritanceMapping, ScalarType, TYPE_ID_COLUMN, TypeIdx,
};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub ty: ScalarType,
    pub nullable: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKeySchema {
    pub columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

/// A mapped table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKeySchema>,
    pub unique: Vec<Vec<String>>,
    /// Discriminator column of single-table hierarchies
    pub discriminator: Option<String>,
}

impl TableSchema {
    fn new(name: String) -> Self {
        Self {
            name,
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
            unique: Vec::new(),
            discriminator: None,
        }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    fn add_foreign_key(&mut self, fk: ForeignKeySchema) {
        if !self.foreign_keys.contains(&fk) {
            self.foreign_keys.push(fk);
        }
    }
}

/// All tables and sequences of a model.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tables: Vec<TableSchema>,
    by_name: HashMap<String, usize>,
    sequences: Vec<String>,
}

impl Catalog {
    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.by_name.get(name).map(|i| &self.tables[*i])
    }

    pub fn sequences(&self) -> &[String] {
        &self.sequences
    }

    fn push(&mut self, table: TableSchema) -> Result<usize> {
        if self.by_name.contains_key(&table.name) {
            return Err(Error::model(format!(
                "table '{}' is mapped more than once",
                table.name
            )));
        }
        let idx = self.tables.len();
        self.by_name.insert(table.name.clone(), idx);
        self.tables.push(table);
        Ok(idx)
    }

    fn table_mut(&mut self, name: &str) -> Option<&mut TableSchema> {
        let idx = *self.by_name.get(name)?;
        self.tables.get_mut(idx)
    }
}

/// Table a reference to `target` can carry a foreign key into.
///
/// Polymorphic targets of concrete-table hierarchies span several tables and
/// get no foreign key.
fn fk_target(model: &DomainModel, target: TypeIdx) -> Option<(String, Vec<String>)> {
    let def = model.entity(target);
    let hierarchy = model.hierarchy(def.hierarchy);
    let table = match hierarchy.mapping {
        InheritanceMapping::SingleTable => hierarchy.table.clone()?,
        InheritanceMapping::ConcreteTable => {
            if def.descendants.len() != 1 {
                return None;
            }
            def.table.clone()?
        }
    };
    let root = model.entity(hierarchy.root);
    let columns = root.columns[root.key_columns()]
        .iter()
        .map(|c| c.name.clone())
        .collect();
    Some((table, columns))
}

pub(super) fn build(
    model: &mut DomainModel,
    requested: &[Option<String>],
    unique: &[Vec<Vec<String>>],
) -> Result<()> {
    // Table names.
    for h in 0..model.hierarchies.len() {
        let hierarchy = model.hierarchies[h].clone();
        match hierarchy.mapping {
            InheritanceMapping::SingleTable => {
                let root = hierarchy.root.index();
                let name = requested[root]
                    .clone()
                    .unwrap_or_else(|| model.entities[root].name.clone());
                for t in &hierarchy.types {
                    model.entities[t.index()].table = Some(name.clone());
                }
                model.hierarchies[h].table = Some(name);
            }
            InheritanceMapping::ConcreteTable => {
                for t in &hierarchy.types {
                    let entity = &mut model.entities[t.index()];
                    if !entity.is_abstract {
                        entity.table = Some(
                            requested[t.index()]
                                .clone()
                                .unwrap_or_else(|| entity.name.clone()),
                        );
                    }
                }
            }
        }
    }

    let mut catalog = Catalog::default();

    // Columns and primary keys.
    for hierarchy in &model.hierarchies {
        let root = model.entity(hierarchy.root);
        let primary_key: Vec<String> = root.columns[root.key_columns()]
            .iter()
            .map(|c| c.name.clone())
            .collect();
        match hierarchy.mapping {
            InheritanceMapping::SingleTable => {
                let Some(name) = hierarchy.table.clone() else {
                    continue;
                };
                let mut table = TableSchema::new(name);
                table.discriminator = Some(TYPE_ID_COLUMN.to_string());
                table.columns.push(ColumnSchema {
                    name: TYPE_ID_COLUMN.to_string(),
                    ty: ScalarType::Int,
                    nullable: false,
                });
                for t in &hierarchy.types {
                    let entity = model.entity(*t);
                    for column in &entity.columns {
                        match table.column(&column.name) {
                            Some(existing) if existing.ty != column.ty => {
                                return Err(Error::model(format!(
                                    "column '{}' of table '{}' is mapped with two types",
                                    column.name, table.name
                                )));
                            }
                            Some(_) => {}
                            None => table.columns.push(ColumnSchema {
                                name: column.name.clone(),
                                ty: column.ty,
                                nullable: column.nullable || *t != hierarchy.root,
                            }),
                        }
                    }
                }
                table.primary_key = primary_key;
                catalog.push(table)?;
            }
            InheritanceMapping::ConcreteTable => {
                for t in &hierarchy.types {
                    let entity = model.entity(*t);
                    let Some(name) = entity.table.clone() else {
                        continue;
                    };
                    let mut table = TableSchema::new(name);
                    table.columns = entity
                        .columns
                        .iter()
                        .map(|c| ColumnSchema {
                            name: c.name.clone(),
                            ty: c.ty,
                            nullable: c.nullable,
                        })
                        .collect();
                    table.primary_key.clone_from(&primary_key);
                    catalog.push(table)?;
                }
            }
        }
    }

    // Foreign keys of stored references.
    for entity in &model.entities {
        let Some(table_name) = entity.table.as_deref() else {
            continue;
        };
        for field in &entity.fields {
            let FieldKind::Reference(target) = field.kind else {
                continue;
            };
            if !field.is_stored() {
                continue;
            }
            let Some((referenced_table, referenced_columns)) = fk_target(model, target) else {
                continue;
            };
            let columns = entity.columns[field.columns.clone()]
                .iter()
                .map(|c| c.name.clone())
                .collect();
            if let Some(table) = catalog.table_mut(table_name) {
                table.add_foreign_key(ForeignKeySchema {
                    columns,
                    referenced_table,
                    referenced_columns,
                });
            }
        }
    }

    // Junction tables.
    for assoc in &model.associations {
        let Some(junction) = &assoc.junction else {
            continue;
        };
        let owner_root = model.entity(model.root_of(assoc.owner_type));
        let target_root = model.entity(model.root_of(assoc.target_type));
        let mut table = TableSchema::new(junction.table.clone());
        for (name, key) in junction
            .owner_columns
            .iter()
            .zip(&owner_root.columns[owner_root.key_columns()])
            .chain(
                junction
                    .target_columns
                    .iter()
                    .zip(&target_root.columns[target_root.key_columns()]),
            )
        {
            table.columns.push(ColumnSchema {
                name: name.clone(),
                ty: key.ty,
                nullable: false,
            });
            table.primary_key.push(name.clone());
        }
        if let Some((referenced_table, referenced_columns)) = fk_target(model, assoc.owner_type) {
            table.add_foreign_key(ForeignKeySchema {
                columns: junction.owner_columns.clone(),
                referenced_table,
                referenced_columns,
            });
        }
        if let Some((referenced_table, referenced_columns)) = fk_target(model, assoc.target_type) {
            table.add_foreign_key(ForeignKeySchema {
                columns: junction.target_columns.clone(),
                referenced_table,
                referenced_columns,
            });
        }
        catalog.push(table)?;
    }

    // Unique indexes.
    for (i, sets) in unique.iter().enumerate() {
        let entity = &model.entities[i];
        for fields in sets {
            let mut columns = Vec::new();
            for name in fields {
                let Some((_, field)) = entity.field(name) else {
                    return Err(Error::model(format!(
                        "unique index on '{}' names unknown field '{name}'",
                        entity.name
                    )));
                };
                if !field.is_stored() {
                    return Err(Error::model(format!(
                        "unique index on '{}' names unstored field '{name}'",
                        entity.name
                    )));
                }
                columns.extend(entity.columns[field.columns.clone()].iter().map(|c| c.name.clone()));
            }
            for d in &entity.descendants {
                let Some(table_name) = model.entities[d.index()].table.as_deref() else {
                    continue;
                };
                if let Some(table) = catalog.table_mut(table_name) {
                    if !table.unique.contains(&columns) {
                        table.unique.push(columns.clone());
                    }
                }
            }
        }
    }

    for entity in &model.entities {
        if let super::KeyGenerator::Sequence(name) = &entity.key_generator {
            if !catalog.sequences.contains(name) {
                catalog.sequences.push(name.clone());
            }
        }
    }

    model.catalog = catalog;
    Ok(())
}
