use anyhow::{Context, Result};
use sqlx::{migrate::Migrator, postgres::PgPool};

pub static MIGRATOR: Migrator = sqlx::migrate!("./src/db/migrations");

/// Applies the coordination schema. Sequence allocation relies on the counter table created
/// here, so a failure is fatal at startup.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("failed to apply tandem postgres migrations")
}

#[cfg(test)]
mod tests {
    use super::MIGRATOR;

    #[test]
    fn embedded_migrations_create_the_coordination_tables() {
        let sql: String = MIGRATOR.iter().map(|migration| migration.sql.to_string()).collect();

        for table in
            ["workspace_members", "object_locks", "object_presence", "stream_sequences", "stream_events"]
        {
            assert!(sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")), "missing {table}");
        }
        assert!(sql.contains("PRIMARY KEY (stream_id, sequence)"));
        assert!(sql.contains("PRIMARY KEY (workspace_id, object_type, object_id)"));
    }
}
