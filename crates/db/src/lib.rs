use std::{str::FromStr, time::Duration};

use sqlx::{
    Error, Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use utils::assets::database_path;

pub mod models;

#[derive(Clone)]
pub struct DBService {
    pub pool: Pool<Sqlite>,
}

impl DBService {
    fn pool_options(in_memory: bool) -> SqlitePoolOptions {
        // Every connection to `sqlite::memory:` opens its own database, so the
        // in-memory pool is pinned to a single connection.
        let max_connections = if in_memory { 1 } else { 20 };
        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .idle_timeout(if in_memory {
                None
            } else {
                Some(Duration::from_secs(300))
            })
            .acquire_timeout(Duration::from_secs(30))
    }

    fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30))
            .synchronous(SqliteSynchronous::Normal);
        if is_in_memory(database_url) {
            Ok(options)
        } else {
            Ok(options.journal_mode(SqliteJournalMode::Wal))
        }
    }

    /// Open the default on-disk database under the asset directory.
    pub async fn new() -> Result<DBService, Error> {
        let database_url = format!("sqlite://{}", database_path().to_string_lossy());
        Self::connect(&database_url).await
    }

    /// Open (or create) the database at `database_url` and run migrations.
    pub async fn connect(database_url: &str) -> Result<DBService, Error> {
        let in_memory = is_in_memory(database_url);
        let pool = Self::pool_options(in_memory)
            .connect_with(Self::connect_options(database_url)?)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!(in_memory, "Database migrations applied");
        if !in_memory {
            sqlx::query("PRAGMA optimize").execute(&pool).await?;
        }
        Ok(DBService { pool })
    }
}

fn is_in_memory(database_url: &str) -> bool {
    database_url.contains(":memory:") || database_url.contains("mode=memory")
}
