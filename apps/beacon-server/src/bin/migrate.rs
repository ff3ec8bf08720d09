//! Applies the users/messages schema used by the PostgreSQL stores.
//!
//! Usage:
//!   cargo run -p beacon-server --bin beacon-migrate
//!   cargo run -p beacon-server --bin beacon-migrate -- --test
//!
//! `--test` targets the `<name>_test` database next to `DATABASE_URL`.

use std::error::Error;
use std::path::Path;
use std::process::ExitCode;

use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

type BoxError = Box<dyn Error + Send + Sync>;

fn main() -> ExitCode {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    let test_db = std::env::args().any(|arg| arg == "--test");
    match run(test_db) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("beacon-migrate: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(test_db: bool) -> Result<(), BoxError> {
    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL env var is required")?;
    let database_url = if test_db {
        test_database_url(&database_url)
    } else {
        database_url
    };

    println!("Connecting to database...");
    let mut conn = PgConnection::establish(&database_url)?;

    let applied = conn.run_pending_migrations(MIGRATIONS)?;
    if applied.is_empty() {
        println!("Schema is up to date.");
    } else {
        for version in &applied {
            println!("  applied {version}");
        }
        println!("{} migration(s) applied.", applied.len());
    }
    Ok(())
}

/// `postgres://h/beacon?x=1` becomes `postgres://h/beacon_test?x=1`.
fn test_database_url(database_url: &str) -> String {
    let (base, query) = match database_url.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (database_url, None),
    };
    let Some((host, name)) = base.rsplit_once('/') else {
        return database_url.to_string();
    };
    if name.is_empty() || name.ends_with("_test") {
        return database_url.to_string();
    }

    let mut url = format!("{host}/{name}_test");
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}
