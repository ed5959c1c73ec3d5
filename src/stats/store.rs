//! Durable statistics store backed by SQLite.
//!
//! Every mutation is a single parameterized statement: an insert, an
//! update-by-id, or an upsert-on-conflict. Connections can live for hours,
//! so nothing here opens a transaction spanning a connection's lifetime.

use anyhow::Result;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::stats::models::{ConnectionRecord, GeoTotals, ServerTotals};

pub struct StatsStore {
    pool: SqlitePool,
}

impl StatsStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Direct pool access for collaborators that run richer ad-hoc queries.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the schema and seed the singleton server_stats row.
    pub async fn init(&self, start_time: i64) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_ip TEXT NOT NULL,
                target_addr TEXT NOT NULL,
                country TEXT NOT NULL DEFAULT '',
                city TEXT NOT NULL DEFAULT '',
                bytes_in INTEGER NOT NULL DEFAULT 0,
                bytes_out INTEGER NOT NULL DEFAULT 0,
                connected_at INTEGER NOT NULL,
                disconnected_at INTEGER,
                duration INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_connections_client_ip ON connections(client_ip)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_connections_country ON connections(country)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_connections_connected_at ON connections(connected_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS server_stats (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                start_time INTEGER NOT NULL,
                total_connections INTEGER NOT NULL DEFAULT 0,
                total_bytes_in INTEGER NOT NULL DEFAULT 0,
                total_bytes_out INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS geo_stats (
                country TEXT PRIMARY KEY,
                country_name TEXT NOT NULL DEFAULT '',
                connections INTEGER NOT NULL DEFAULT 0,
                total_bytes INTEGER NOT NULL DEFAULT 0,
                last_updated INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO server_stats
                (id, start_time, total_connections, total_bytes_in, total_bytes_out, updated_at)
            VALUES (1, ?, 0, 0, 0, ?)
            "#,
        )
        .bind(start_time)
        .bind(start_time)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a new connection record with zero counters and null close
    /// fields. Returns the record id.
    pub async fn insert_connection(
        &self,
        client_ip: &str,
        target_addr: &str,
        country: &str,
        city: &str,
        connected_at: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO connections (client_ip, target_addr, country, city, connected_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(client_ip)
        .bind(target_addr)
        .bind(country)
        .bind(city)
        .bind(connected_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Fill in the close fields of one record. Called exactly once per
    /// connection by the tracker's guarded close.
    pub async fn finalize_connection(
        &self,
        id: i64,
        bytes_in: i64,
        bytes_out: i64,
        disconnected_at: i64,
        duration: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE connections
            SET bytes_in = ?, bytes_out = ?, disconnected_at = ?, duration = ?
            WHERE id = ?
            "#,
        )
        .bind(bytes_in)
        .bind(bytes_out)
        .bind(disconnected_at)
        .bind(duration)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Add deltas to the monotonic server totals.
    pub async fn bump_server_totals(
        &self,
        conn_delta: i64,
        bytes_in: i64,
        bytes_out: i64,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE server_stats
            SET total_connections = total_connections + ?,
                total_bytes_in = total_bytes_in + ?,
                total_bytes_out = total_bytes_out + ?,
                updated_at = ?
            WHERE id = 1
            "#,
        )
        .bind(conn_delta)
        .bind(bytes_in)
        .bind(bytes_out)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upsert per-country totals.
    pub async fn upsert_geo_totals(
        &self,
        country: &str,
        country_name: &str,
        conn_delta: i64,
        bytes: i64,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO geo_stats (country, country_name, connections, total_bytes, last_updated)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(country) DO UPDATE SET
                connections = connections + excluded.connections,
                total_bytes = total_bytes + excluded.total_bytes,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(country)
        .bind(country_name)
        .bind(conn_delta)
        .bind(bytes)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn server_totals(&self) -> Result<ServerTotals> {
        let totals = sqlx::query_as::<_, ServerTotals>(
            r#"
            SELECT start_time, total_connections, total_bytes_in, total_bytes_out, updated_at
            FROM server_stats
            WHERE id = 1
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(totals)
    }

    pub async fn top_countries(&self, limit: i64) -> Result<Vec<GeoTotals>> {
        let rows = sqlx::query_as::<_, GeoTotals>(
            r#"
            SELECT country, country_name, connections, total_bytes, last_updated
            FROM geo_stats
            ORDER BY connections DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn get_connection(&self, id: i64) -> Result<Option<ConnectionRecord>> {
        let record = sqlx::query_as::<_, ConnectionRecord>(
            r#"
            SELECT id, client_ip, target_addr, country, city, bytes_in, bytes_out,
                   connected_at, disconnected_at, duration
            FROM connections
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn recent_connections(&self, limit: i64) -> Result<Vec<ConnectionRecord>> {
        let rows = sqlx::query_as::<_, ConnectionRecord>(
            r#"
            SELECT id, client_ip, target_addr, country, city, bytes_in, bytes_out,
                   connected_at, disconnected_at, duration
            FROM connections
            ORDER BY connected_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Delete connection records older than the cutoff. Aggregates are
    /// never recomputed, so totals stay monotonic after a sweep.
    pub async fn prune_connections_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM connections WHERE connected_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Database size via SQLite's page introspection pragmas.
    pub async fn database_size_bytes(&self) -> Result<i64> {
        let size = sqlx::query_scalar::<_, i64>(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> StatsStore {
        // A single pooled connection keeps the in-memory database shared.
        let store = StatsStore::connect("sqlite::memory:", 1).await.unwrap();
        store.init(1_700_000_000).await.unwrap();
        store
    }

    #[tokio::test]
    async fn insert_then_finalize_fills_close_fields_once() {
        let s = store().await;

        let id = s
            .insert_connection("203.0.113.9", "example.com:443", "DE", "Berlin", 1_700_000_100)
            .await
            .unwrap();

        let open = s.get_connection(id).await.unwrap().unwrap();
        assert_eq!(open.bytes_in, 0);
        assert_eq!(open.disconnected_at, None);
        assert_eq!(open.duration, None);

        s.finalize_connection(id, 1024, 2048, 1_700_000_160, 60)
            .await
            .unwrap();

        let closed = s.get_connection(id).await.unwrap().unwrap();
        assert_eq!(closed.bytes_in, 1024);
        assert_eq!(closed.bytes_out, 2048);
        assert_eq!(closed.disconnected_at, Some(1_700_000_160));
        assert_eq!(closed.duration, Some(60));
    }

    #[tokio::test]
    async fn server_totals_accumulate_monotonically() {
        let s = store().await;

        s.bump_server_totals(1, 0, 0, 1).await.unwrap();
        s.bump_server_totals(1, 0, 0, 2).await.unwrap();
        s.bump_server_totals(0, 100, 200, 3).await.unwrap();

        let totals = s.server_totals().await.unwrap();
        assert_eq!(totals.total_connections, 2);
        assert_eq!(totals.total_bytes_in, 100);
        assert_eq!(totals.total_bytes_out, 200);
    }

    #[tokio::test]
    async fn geo_totals_upsert_on_conflict() {
        let s = store().await;

        s.upsert_geo_totals("DE", "Germany", 1, 0, 1).await.unwrap();
        s.upsert_geo_totals("DE", "Germany", 0, 512, 2).await.unwrap();
        s.upsert_geo_totals("FR", "France", 1, 0, 3).await.unwrap();

        let top = s.top_countries(20).await.unwrap();
        assert_eq!(top.len(), 2);
        let de = top.iter().find(|g| g.country == "DE").unwrap();
        assert_eq!(de.connections, 1);
        assert_eq!(de.total_bytes, 512);
    }

    #[tokio::test]
    async fn prune_removes_only_old_records() {
        let s = store().await;

        let old = s
            .insert_connection("10.0.0.1", "a:1", "", "", 1_000)
            .await
            .unwrap();
        let new = s
            .insert_connection("10.0.0.2", "b:2", "", "", 2_000)
            .await
            .unwrap();
        s.bump_server_totals(2, 10, 10, 2_000).await.unwrap();

        let removed = s.prune_connections_before(1_500).await.unwrap();
        assert_eq!(removed, 1);
        assert!(s.get_connection(old).await.unwrap().is_none());
        assert!(s.get_connection(new).await.unwrap().is_some());

        // Aggregates are untouched by the sweep.
        let totals = s.server_totals().await.unwrap();
        assert_eq!(totals.total_connections, 2);
    }

    #[tokio::test]
    async fn database_size_is_reported() {
        let s = store().await;
        assert!(s.database_size_bytes().await.unwrap() > 0);
    }
}
