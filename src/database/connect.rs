use std::error::Error;

use diesel::{Connection, ConnectionError, RunQueryDsl, SqliteConnection};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

// open the sqlite database; foreign keys are per-connection in sqlite
pub fn establish_connection(database_url: &str) -> Result<SqliteConnection, ConnectionError> {
    let mut conn = SqliteConnection::establish(database_url)?;
    diesel::sql_query("PRAGMA foreign_keys = ON")
        .execute(&mut conn)
        .map_err(ConnectionError::CouldntSetupConfiguration)?;
    Ok(conn)
}

// run diesel migrations, returns how many were applied
pub fn run_migrations(conn: &mut SqliteConnection) -> Result<usize, Box<dyn Error + Send + Sync>> {
    conn.run_pending_migrations(MIGRATIONS).map(|applied| applied.len())
}

#[cfg(test)]
pub fn test_connection() -> SqliteConnection {
    let mut conn = establish_connection(":memory:").unwrap();
    run_migrations(&mut conn).unwrap();
    conn
}
