use std::env;

/// Database configuration for the catalog.
///
/// Reads from the `CONVEY_DATABASE_URL` environment variable, falling back
/// to `postgresql://localhost:5432/convey` when unset. The warehouse the
/// sink writes to may live in a different database; when
/// `CONVEY_WAREHOUSE_URL` is unset the catalog database doubles as the
/// warehouse.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Full PostgreSQL connection URL for the catalog.
    pub database_url: String,
    /// Connection URL for the warehouse the sink lands rows into.
    pub warehouse_url: String,
}

impl DbConfig {
    /// The default connection URL used when no environment variable is set.
    pub const DEFAULT_URL: &str = "postgresql://localhost:5432/convey";

    /// Build a config from the environment.
    ///
    /// Priority: `CONVEY_DATABASE_URL` env var, then the compile-time
    /// default. `CONVEY_WAREHOUSE_URL` falls back to the catalog URL.
    pub fn from_env() -> Self {
        let database_url =
            env::var("CONVEY_DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        let warehouse_url =
            env::var("CONVEY_WAREHOUSE_URL").unwrap_or_else(|_| database_url.clone());
        Self {
            database_url,
            warehouse_url,
        }
    }

    /// Build a config from an explicit URL (useful for tests and CLI flags).
    /// The warehouse shares the catalog database.
    pub fn new(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        Self {
            warehouse_url: database_url.clone(),
            database_url,
        }
    }

    /// Extract the database name from the catalog URL.
    ///
    /// Returns `None` if the URL cannot be parsed or has no path component.
    pub fn database_name(&self) -> Option<&str> {
        // URLs look like: postgresql://host:port/dbname
        self.database_url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
    }

    /// Return a URL pointing at the `postgres` maintenance database on the
    /// same host. Used to issue `CREATE DATABASE` when the target DB does
    /// not yet exist.
    pub fn maintenance_url(&self) -> String {
        match self.database_url.rfind('/') {
            Some(pos) => {
                let mut url = self.database_url[..pos].to_owned();
                url.push_str("/postgres");
                url
            }
            None => self.database_url.clone(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_url() {
        let cfg = DbConfig::new(DbConfig::DEFAULT_URL);
        assert_eq!(cfg.database_url, "postgresql://localhost:5432/convey");
        assert_eq!(cfg.warehouse_url, cfg.database_url);
    }

    #[test]
    fn database_name_extraction() {
        let cfg = DbConfig::new("postgresql://localhost:5432/mydb");
        assert_eq!(cfg.database_name(), Some("mydb"));
    }

    #[test]
    fn maintenance_url_replaces_db() {
        let cfg = DbConfig::new("postgresql://localhost:5432/convey");
        assert_eq!(cfg.maintenance_url(), "postgresql://localhost:5432/postgres");
    }

    #[test]
    fn explicit_new() {
        let cfg = DbConfig::new("postgresql://remotehost:5433/other");
        assert_eq!(cfg.database_url, "postgresql://remotehost:5433/other");
        assert_eq!(cfg.database_name(), Some("other"));
    }
}
