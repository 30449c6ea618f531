//! Schema generator: produce and optionally execute DDL.

use super::diff::{LiveSchema, SchemaDiff};
use super::ops::DdlOp;
use super::platform::Platform;
use crate::catalog::MetadataRegistry;
use crate::driver::Driver;
use crate::error::Error;
use std::sync::Arc;
use tracing::debug;

/// Generates DDL from the registry and reconciles it against the live
/// schema through the driver's schema primitives.
pub struct SchemaGenerator {
    registry: Arc<MetadataRegistry>,
    driver: Arc<dyn Driver>,
    platform: Box<dyn Platform>,
}

impl SchemaGenerator {
    /// Create a generator over a registry, driver, and platform.
    pub fn new(
        registry: Arc<MetadataRegistry>,
        driver: Arc<dyn Driver>,
        platform: Box<dyn Platform>,
    ) -> Self {
        Self {
            registry,
            driver,
            platform,
        }
    }

    /// Produce the full drop-and-create script without executing it.
    pub fn generate(&self) -> Result<String, Error> {
        let drop = self.drop_schema(false, false)?;
        let create = self.create_schema(false, false)?;
        Ok(self.wrap(format!("{drop}{create}"), true))
    }

    /// Emit CREATE TABLE operations for every declared entity.
    pub fn create_schema(&self, execute: bool, wrap: bool) -> Result<String, Error> {
        let capabilities = self.driver.capabilities();
        let ops = SchemaDiff::compute(
            &self.registry,
            &LiveSchema::new(),
            &capabilities,
            self.platform.as_ref(),
        )?;
        let sql = self.dump(&ops, execute)?;
        Ok(self.wrap(sql, wrap))
    }

    /// Emit DROP TABLE operations for every declared entity.
    pub fn drop_schema(&self, execute: bool, wrap: bool) -> Result<String, Error> {
        let ops: Vec<DdlOp> = self
            .registry
            .entities()
            .map(|meta| DdlOp::DropTable {
                table: meta.collection.clone(),
            })
            .collect();
        let sql = self.dump(&ops, execute)?;
        Ok(self.wrap(sql, wrap))
    }

    /// Diff the declared metadata against the introspected live schema and
    /// emit the minimal reconciliation.
    pub fn update_schema(&self, execute: bool, wrap: bool) -> Result<String, Error> {
        let live = self.introspect()?;
        let capabilities = self.driver.capabilities();
        let ops = SchemaDiff::compute(
            &self.registry,
            &live,
            &capabilities,
            self.platform.as_ref(),
        )?;
        debug!(ops = ops.len(), "computed schema update");
        let sql = self.dump(&ops, execute)?;
        Ok(self.wrap(sql, wrap))
    }

    /// Build a live-schema description from driver introspection.
    fn introspect(&self) -> Result<LiveSchema, Error> {
        let mut live = LiveSchema::new();
        for table in self.driver.list_tables()? {
            let columns = self.driver.column_info(&table)?;
            live = live.with_table(table, columns);
        }
        Ok(live)
    }

    /// Render operations as SQL text and optionally execute them in order.
    fn dump(&self, ops: &[DdlOp], execute: bool) -> Result<String, Error> {
        let mut sql = String::new();
        for op in ops {
            if execute {
                debug!(table = %op.table(), "executing ddl");
                self.driver.execute(op)?;
            }
            sql.push_str(&self.platform.render(op));
            sql.push_str("\n\n");
        }
        Ok(sql)
    }

    fn wrap(&self, sql: String, wrap: bool) -> String {
        if !wrap {
            return sql;
        }
        format!(
            "{}{}{}",
            self.platform.schema_beginning(),
            sql,
            self.platform.schema_end()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityMetadata, EntityProperty, ScalarType};
    use crate::driver::MemoryDriver;
    use crate::schema::platform::{GenericSqlPlatform, SqlitePlatform};

    fn registry() -> Arc<MetadataRegistry> {
        let user = EntityMetadata::new("User", "id")
            .with_property(EntityProperty::scalar("id", ScalarType::Int64))
            .with_property(EntityProperty::scalar("name", ScalarType::String));
        Arc::new(MetadataRegistry::builder().entity(user).build().unwrap())
    }

    fn generator(registry: Arc<MetadataRegistry>, driver: Arc<MemoryDriver>) -> SchemaGenerator {
        SchemaGenerator::new(registry, driver, Box::new(GenericSqlPlatform))
    }

    #[test]
    fn test_create_schema_text_and_execution() {
        let driver = Arc::new(MemoryDriver::new());
        let generator = generator(registry(), Arc::clone(&driver));

        let sql = generator.create_schema(true, false).unwrap();
        assert!(sql.contains("create table \"user\""));
        assert_eq!(
            driver.list_tables().unwrap(),
            vec!["user".to_string()]
        );
    }

    #[test]
    fn test_update_after_create_is_empty() {
        let driver = Arc::new(MemoryDriver::new());
        let generator = generator(registry(), Arc::clone(&driver));

        generator.create_schema(true, false).unwrap();
        let sql = generator.update_schema(true, false).unwrap();
        assert!(sql.is_empty());
    }

    #[test]
    fn test_drop_schema() {
        let driver = Arc::new(MemoryDriver::new());
        let generator = generator(registry(), Arc::clone(&driver));

        generator.create_schema(true, false).unwrap();
        let sql = generator.drop_schema(true, false).unwrap();
        assert!(sql.contains("drop table if exists \"user\""));
        assert!(driver.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_generate_wraps_with_platform_text() {
        let driver = Arc::new(MemoryDriver::new());
        let generator =
            SchemaGenerator::new(registry(), driver, Box::new(SqlitePlatform));

        let sql = generator.generate().unwrap();
        assert!(sql.starts_with("pragma foreign_keys = off;"));
        assert!(sql.trim_end().ends_with("pragma foreign_keys = on;"));
        assert!(sql.contains("drop table if exists \"user\""));
        assert!(sql.contains("create table \"user\""));
    }
}
