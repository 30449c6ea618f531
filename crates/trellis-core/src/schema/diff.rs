//! Schema diffing: declared metadata against a live schema.
//!
//! A pure function from (registry, live schema, driver capabilities) to an
//! ordered list of DDL operations. Applying the result and re-diffing
//! yields an empty set.

use super::ops::{ColumnSpec, DdlOp, FkAction, ForeignKeySpec};
use super::platform::Platform;
use crate::catalog::{EntityMetadata, EntityProperty, MetadataRegistry, RelationKind};
use crate::driver::DriverCapabilities;
use crate::error::Error;
use std::collections::BTreeMap;
use trellis_proto::ColumnInfo;

/// Introspected live schema: table name to live columns.
#[derive(Debug, Clone, Default)]
pub struct LiveSchema {
    tables: BTreeMap<String, Vec<ColumnInfo>>,
}

impl LiveSchema {
    /// Create an empty live schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table description.
    pub fn with_table(mut self, name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        self.tables.insert(name.into(), columns);
        self
    }

    /// Get a table's columns.
    pub fn table(&self, name: &str) -> Option<&[ColumnInfo]> {
        self.tables.get(name).map(Vec::as_slice)
    }

    /// Iterate over live table names.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}

/// The schema diff engine.
pub struct SchemaDiff;

impl SchemaDiff {
    /// Compute the DDL operations that reconcile the live schema with the
    /// declared metadata. Creates come first, then per-table column
    /// changes, then drops of undeclared tables.
    pub fn compute(
        registry: &MetadataRegistry,
        live: &LiveSchema,
        capabilities: &DriverCapabilities,
        platform: &dyn Platform,
    ) -> Result<Vec<DdlOp>, Error> {
        let mut ops = Vec::new();

        for meta in registry.entities() {
            match live.table(&meta.collection) {
                None => ops.push(Self::create_table(meta, registry, capabilities, platform)?),
                Some(columns) => {
                    Self::update_table(meta, registry, columns, capabilities, platform, &mut ops)?;
                }
            }
        }

        let declared: Vec<&str> = registry
            .entities()
            .map(|m| m.collection.as_str())
            .collect();
        for table in live.tables() {
            if !declared.contains(&table) {
                ops.push(DdlOp::DropTable {
                    table: table.to_string(),
                });
            }
        }

        Ok(ops)
    }

    /// Build the full CREATE for a declared entity.
    fn create_table(
        meta: &EntityMetadata,
        registry: &MetadataRegistry,
        capabilities: &DriverCapabilities,
        platform: &dyn Platform,
    ) -> Result<DdlOp, Error> {
        let mut columns = Vec::new();
        let mut foreign_keys = Vec::new();

        for prop in &meta.properties {
            if !Self::should_have_column(prop, capabilities) {
                continue;
            }
            columns.push(Self::column_spec(meta, prop, registry, platform)?);

            if prop.is_relation() && capabilities.schema_constraints {
                foreign_keys.push(Self::foreign_key(prop, registry)?);
            }
        }

        Ok(DdlOp::CreateTable {
            table: meta.collection.clone(),
            columns,
            foreign_keys,
        })
    }

    /// Diff one existing table against its declared properties.
    fn update_table(
        meta: &EntityMetadata,
        registry: &MetadataRegistry,
        live_columns: &[ColumnInfo],
        capabilities: &DriverCapabilities,
        platform: &dyn Platform,
        ops: &mut Vec<DdlOp>,
    ) -> Result<(), Error> {
        let declared: Vec<(&EntityProperty, ColumnSpec)> = meta
            .properties
            .iter()
            .filter(|p| Self::should_have_column(p, capabilities))
            .map(|p| Ok((p, Self::column_spec(meta, p, registry, platform)?)))
            .collect::<Result<_, Error>>()?;

        for (_, spec) in &declared {
            let live = live_columns.iter().find(|c| c.name == spec.name);
            match live {
                None => ops.push(DdlOp::AddColumn {
                    table: meta.collection.clone(),
                    column: spec.clone(),
                }),
                Some(live) if !Self::is_same(spec, live) => {
                    // Left unchanged on platforms that cannot alter columns,
                    // a documented limitation rather than an error.
                    if capabilities.column_alter {
                        let mut spec = spec.clone();
                        if capabilities.nullable_for_alter {
                            spec.nullable = true;
                        }
                        ops.push(DdlOp::AlterColumn {
                            table: meta.collection.clone(),
                            column: spec,
                        });
                    }
                }
                Some(_) => {}
            }
        }

        for live in live_columns {
            if !declared.iter().any(|(_, spec)| spec.name == live.name) {
                ops.push(DdlOp::DropColumn {
                    table: meta.collection.clone(),
                    column: live.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Whether a declared property occupies a column. Foreign-key columns
    /// exist only on backends that support schema constraints.
    fn should_have_column(prop: &EntityProperty, capabilities: &DriverCapabilities) -> bool {
        match prop.kind {
            RelationKind::Scalar => true,
            RelationKind::ManyToOne => capabilities.schema_constraints,
            RelationKind::OneToOne => prop.owner && capabilities.schema_constraints,
            RelationKind::OneToMany | RelationKind::ManyToMany => false,
        }
    }

    fn column_spec(
        meta: &EntityMetadata,
        prop: &EntityProperty,
        registry: &MetadataRegistry,
        platform: &dyn Platform,
    ) -> Result<ColumnSpec, Error> {
        let (scalar, length) = match prop.scalar_type {
            Some(scalar) => (scalar, prop.length),
            // Relation columns take the type of the target's primary key.
            None => {
                let pk = Self::target_primary(prop, registry)?;
                (
                    pk.scalar_type.ok_or_else(|| {
                        Error::InvalidMetadata(format!(
                            "primary key '{}' has no scalar type",
                            pk.name
                        ))
                    })?,
                    pk.length,
                )
            }
        };

        let mut spec = ColumnSpec::new(&prop.field_name, platform.type_name(scalar, length));
        spec.primary = prop.name == meta.primary_key;
        spec.nullable = prop.nullable;
        spec.unique = prop.unique;
        spec.default = prop.default.as_ref().map(|v| platform.value_literal(v));
        Ok(spec)
    }

    fn foreign_key(
        prop: &EntityProperty,
        registry: &MetadataRegistry,
    ) -> Result<ForeignKeySpec, Error> {
        let target = registry.get(prop.target.as_deref().unwrap_or_default())?;
        let pk = Self::target_primary(prop, registry)?;

        Ok(ForeignKeySpec {
            column: prop.field_name.clone(),
            references_table: target.collection.clone(),
            references_column: pk.field_name.clone(),
            on_delete: if prop.cascade_remove() {
                FkAction::Cascade
            } else {
                FkAction::SetNull
            },
            on_update: prop.cascade_persist().then_some(FkAction::Cascade),
        })
    }

    fn target_primary<'a>(
        prop: &EntityProperty,
        registry: &'a MetadataRegistry,
    ) -> Result<&'a EntityProperty, Error> {
        let target = registry.get(prop.target.as_deref().unwrap_or_default())?;
        target.primary_property().ok_or_else(|| {
            Error::InvalidMetadata(format!(
                "entity '{}' has no primary property",
                target.name
            ))
        })
    }

    /// Column equivalence as introspection can observe it: storage type,
    /// nullability, and default literal.
    fn is_same(declared: &ColumnSpec, live: &ColumnInfo) -> bool {
        declared.column_type == live.column_type
            && declared.nullable == live.nullable
            && declared.default == live.default
    }
}
